pub mod catalog;
pub mod content;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::operation::Progress;

/// One downloadable unit of content named by a catalog.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ContentLocation {
    pub id: String,
    pub primary_key: String,
    /// Byte size as recorded in the catalog, if known.
    #[serde(default)]
    pub size: Option<u64>,
    /// Expected SHA-256 of the content, hex encoded.
    #[serde(default)]
    pub hash: Option<String>,
}

impl ContentLocation {
    pub fn new(id: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            primary_key: primary_key.into(),
            size: None,
            hash: None,
        }
    }
}

/// Remote catalog versioning service.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Catalog ids whose remote version differs from the local one.
    async fn check_for_updates(&self, force: bool, progress: &Progress) -> Result<Vec<String>>;

    /// Download and install the given catalogs.
    async fn update_catalogs(&self, catalogs: &[String], auto_release: bool, progress: &Progress) -> Result<()>;
}

/// Remote content size/download service. Both calls are cache aware:
/// content already held locally costs zero bytes and is not fetched again.
#[async_trait]
pub trait ContentService: Send + Sync {
    async fn download_size(&self, locations: &[ContentLocation], progress: &Progress) -> Result<u64>;

    async fn download_dependencies(&self, locations: &[ContentLocation], progress: &Progress) -> Result<()>;
}

pub trait ResourceLocator: Send + Sync {
    fn locator_id(&self) -> &str;

    fn keys(&self) -> Vec<String>;

    /// `None` when the key is unknown to this locator.
    fn locate(&self, key: &str) -> Option<Vec<ContentLocation>>;
}

/// Read-only view over every locator known locally.
pub trait LocatorRegistry: Send + Sync {
    fn locators(&self) -> Vec<Arc<dyn ResourceLocator>>;
}

/// The three collaborators a coordinator talks to.
#[derive(Clone)]
pub struct Services {
    pub catalogs: Arc<dyn CatalogService>,
    pub content: Arc<dyn ContentService>,
    pub registry: Arc<dyn LocatorRegistry>,
}
