use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use url::Url;

use super::{CatalogService, ContentLocation, LocatorRegistry, ResourceLocator};
use crate::error::{Result, UpdateError};
use crate::operation::Progress;
use crate::utils::{resolve_url, validate_catalog_id};

/// A catalog as served by `<server>/<id>.json`: keys mapped to the content
/// they need.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CatalogManifest {
    pub locator_id: String,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ContentLocation>>,
}

impl ResourceLocator for CatalogManifest {
    fn locator_id(&self) -> &str {
        &self.locator_id
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn locate(&self, key: &str) -> Option<Vec<ContentLocation>> {
        self.entries.get(key).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct InstalledCatalog {
    pub id: String,
    pub hash: Option<String>,
}

/// Installed catalogs under `<data>/catalogs`: `<id>.json` plus the
/// `<id>.hash` it was installed from.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    dir: PathBuf,
}

impl CatalogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn hash_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.hash", id))
    }

    pub fn local_hash(&self, id: &str) -> Option<String> {
        std::fs::read_to_string(self.hash_path(id))
            .ok()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
    }

    /// Validate and install a catalog body. The manifest is replaced
    /// atomically and the hash written last, so an interrupted install is
    /// seen as outdated on the next check.
    pub async fn install(&self, id: &str, body: &str, hash: &str) -> Result<()> {
        validate_catalog_id(id)?;
        serde_json::from_str::<CatalogManifest>(body)?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| UpdateError::storage(&self.dir, e))?;

        let target = self.manifest_path(id);
        let temp = self.dir.join(format!(".{}.{}.tmp", id, uuid::Uuid::new_v4()));
        fs::write(&temp, body).await.map_err(|e| UpdateError::storage(&temp, e))?;
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(UpdateError::storage(&target, e));
        }

        let hash_path = self.hash_path(id);
        fs::write(&hash_path, hash.trim())
            .await
            .map_err(|e| UpdateError::storage(&hash_path, e))?;
        Ok(())
    }

    pub fn installed(&self) -> Vec<InstalledCatalog> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut catalogs: Vec<InstalledCatalog> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let id = path.file_stem()?.to_str()?.to_string();
                if id.starts_with('.') {
                    return None;
                }
                Some(InstalledCatalog {
                    hash: self.local_hash(&id),
                    id,
                })
            })
            .collect();
        catalogs.sort_by(|a, b| a.id.cmp(&b.id));
        catalogs
    }

    pub fn load(&self, id: &str) -> Result<CatalogManifest> {
        let path = self.manifest_path(id);
        let body = std::fs::read_to_string(&path).map_err(|e| UpdateError::storage(&path, e))?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl LocatorRegistry for CatalogStore {
    fn locators(&self) -> Vec<Arc<dyn ResourceLocator>> {
        let mut locators: Vec<Arc<dyn ResourceLocator>> = Vec::new();
        for catalog in self.installed() {
            match self.load(&catalog.id) {
                Ok(manifest) => locators.push(Arc::new(manifest)),
                Err(e) => log::warn!("skipping catalog {}: {}", catalog.id, e),
            }
        }
        locators
    }
}

/// Catalog versioning over plain HTTP: `<id>.hash` names the current
/// version, `<id>.json` holds the manifest.
pub struct HttpCatalogService {
    client: Client,
    base: Url,
    catalog_ids: Vec<String>,
    store: CatalogStore,
}

impl HttpCatalogService {
    pub fn new(client: Client, base: Url, catalog_ids: Vec<String>, store: CatalogStore) -> Self {
        Self {
            client,
            base,
            catalog_ids,
            store,
        }
    }

    async fn fetch_text(&self, name: &str) -> Result<String> {
        let url = resolve_url(&self.base, name)?;
        let resp = self.client.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(UpdateError::Network(format!("GET {} returned {}", url, resp.status())));
        }
        Ok(resp.text().await?)
    }

    async fn remote_hash(&self, id: &str) -> Result<String> {
        validate_catalog_id(id)?;
        let hash = self.fetch_text(&format!("{}.hash", id)).await?;
        Ok(hash.trim().to_string())
    }

    async fn update_one(&self, id: &str) -> Result<()> {
        let hash = self.remote_hash(id).await?;
        let body = self.fetch_text(&format!("{}.json", id)).await?;
        self.store.install(id, &body, &hash).await?;
        log::info!("installed catalog {} ({})", id, hash);
        Ok(())
    }
}

#[async_trait]
impl CatalogService for HttpCatalogService {
    async fn check_for_updates(&self, force: bool, progress: &Progress) -> Result<Vec<String>> {
        let total = self.catalog_ids.len() as u64;
        let mut changed = Vec::new();
        let mut failed = 0;

        for (i, id) in self.catalog_ids.iter().enumerate() {
            match self.remote_hash(id).await {
                Ok(remote) => {
                    let local = self.store.local_hash(id);
                    if force || local.as_deref() != Some(remote.as_str()) {
                        log::debug!("catalog {} changed: {:?} -> {}", id, local, remote);
                        changed.push(id.clone());
                    }
                }
                Err(e) => {
                    log::warn!("failed to check catalog {}: {}", id, e);
                    failed += 1;
                }
            }
            progress.set_ratio(i as u64 + 1, total);
        }

        // One unreachable catalog must not hide updates to the others.
        if total > 0 && failed == total {
            return Err(UpdateError::Network(format!("all {} catalogs failed to check", total)));
        }
        Ok(changed)
    }

    // Installed catalogs are always persisted, so `auto_release` changes
    // nothing for this backend.
    async fn update_catalogs(&self, catalogs: &[String], _auto_release: bool, progress: &Progress) -> Result<()> {
        let total = catalogs.len() as u64;
        let mut failed = 0;

        for (i, id) in catalogs.iter().enumerate() {
            if let Err(e) = self.update_one(id).await {
                log::warn!("failed to update catalog {}: {}", id, e);
                failed += 1;
            }
            progress.set_ratio(i as u64 + 1, total);
        }

        if failed > 0 {
            return Err(UpdateError::Network(format!(
                "{} of {} catalogs failed to update",
                failed, total
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{
        "locator_id": "main",
        "entries": {
            "prefabs/cube.prefab": [
                { "id": "bundles/cube.bundle", "primary_key": "prefabs/cube.prefab", "size": 1024 }
            ],
            "prefabs/launch.prefab": [
                { "id": "bundles/launch.bundle", "primary_key": "prefabs/launch.prefab" },
                { "id": "bundles/shared.bundle", "primary_key": "prefabs/launch.prefab", "hash": "abcd" }
            ]
        }
    }"#;

    #[tokio::test]
    async fn test_install_and_locate() {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::new(dir.path().join("catalogs"));

        assert!(store.local_hash("catalog").is_none());
        store.install("catalog", MANIFEST, "v1\n").await.unwrap();
        assert_eq!(store.local_hash("catalog").as_deref(), Some("v1"));

        let locators = store.locators();
        assert_eq!(locators.len(), 1);
        assert_eq!(locators[0].locator_id(), "main");
        assert_eq!(locators[0].keys().len(), 2);

        let launch = locators[0].locate("prefabs/launch.prefab").unwrap();
        assert_eq!(launch.len(), 2);
        assert_eq!(launch[1].hash.as_deref(), Some("abcd"));
        assert!(locators[0].locate("missing").is_none());
    }

    #[tokio::test]
    async fn test_install_rejects_bad_manifest() {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::new(dir.path());

        let err = store.install("catalog", "{ not json", "v2").await.unwrap_err();
        assert!(matches!(err, UpdateError::UnexpectedAssetShape(_)));
        assert!(store.local_hash("catalog").is_none());
        assert!(store.installed().is_empty());
    }

    #[tokio::test]
    async fn test_reinstall_replaces_manifest() {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::new(dir.path());

        store.install("catalog", MANIFEST, "v1").await.unwrap();
        store
            .install("catalog", r#"{ "locator_id": "main", "entries": {} }"#, "v2")
            .await
            .unwrap();

        let installed = store.installed();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].hash.as_deref(), Some("v2"));
        assert!(store.load("catalog").unwrap().entries.is_empty());
    }

    /// Answers every request with `200 OK` and `body`.
    async fn serve_text(body: &'static str) -> Url {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 2048];
                    let _ = socket.read(&mut request).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_check_reports_reachable_catalogs_despite_failures() {
        let dir = TempDir::new().unwrap();
        let base = serve_text("v2\n").await;
        let ids = vec!["../escape".to_string(), "main".to_string(), "dlc".to_string()];
        let store = CatalogStore::new(dir.path());
        store
            .install("dlc", r#"{ "locator_id": "dlc", "entries": {} }"#, "v2")
            .await
            .unwrap();
        let service = HttpCatalogService::new(Client::new(), base, ids, store);

        let progress = Progress::new();
        let changed = service.check_for_updates(false, &progress).await.unwrap();
        assert_eq!(changed, vec!["main".to_string()]);
        assert_eq!(progress.get(), 1.0);
    }

    #[tokio::test]
    async fn test_check_fails_when_every_catalog_fails() {
        let dir = TempDir::new().unwrap();
        let ids = vec!["../escape".to_string(), ".hidden".to_string()];
        let service = HttpCatalogService::new(
            Client::new(),
            Url::parse("http://127.0.0.1:9/").unwrap(),
            ids,
            CatalogStore::new(dir.path()),
        );

        let err = service.check_for_updates(false, &Progress::new()).await.unwrap_err();
        assert!(matches!(err, UpdateError::Network(ref m) if m.contains("all 2 catalogs")));
    }

    #[test]
    fn test_unreadable_catalog_is_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), "[]").unwrap();
        let store = CatalogStore::new(dir.path());

        assert_eq!(store.installed().len(), 1);
        assert!(store.locators().is_empty());
    }
}
