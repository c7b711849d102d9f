use url::Url;

use crate::error::{Result, UpdateError};
use crate::hashing::digest_str;

/// Parse the server base URL, making sure relative joins land under it.
pub fn server_url(server: &str) -> Result<Url> {
    let mut url = Url::parse(server.trim())
        .map_err(|e| UpdateError::Network(format!("invalid server url {:?}: {}", server, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// URL of a content location or catalog file. Absolute ids are used as is.
pub fn resolve_url(base: &Url, id: &str) -> Result<Url> {
    let id = id.trim();
    if id.is_empty() {
        return Err(UpdateError::UnexpectedAssetShape("empty location id".to_string()));
    }
    base.join(id)
        .map_err(|e| UpdateError::UnexpectedAssetShape(format!("cannot build url for {:?}: {}", id, e)))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Local file name for a content id: a short digest of the full id keeps
/// distinct ids apart, the readable tail keeps listings useful.
pub fn cache_file_name(id: &str) -> Result<String> {
    let id = id.trim();
    let tail = id
        .rsplit('/')
        .next()
        .map(sanitize_filename)
        .unwrap_or_default();
    if tail.is_empty() || tail.chars().all(|c| c == '.') {
        return Err(UpdateError::UnexpectedAssetShape(format!("no file name in location {:?}", id)));
    }
    Ok(format!("{}-{}", &digest_str(id)[..12], tail))
}

/// Catalog ids become file names directly, so they must be plain names.
pub fn validate_catalog_id(id: &str) -> Result<()> {
    if id.is_empty() || id.starts_with('.') || id != sanitize_filename(id) {
        return Err(UpdateError::UnexpectedAssetShape(format!("invalid catalog id {:?}", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_url_gets_trailing_slash() {
        let base = server_url("http://cdn.example.com/game/v1").unwrap();
        assert_eq!(base.as_str(), "http://cdn.example.com/game/v1/");
        assert_eq!(
            resolve_url(&base, "bundles/cube.bundle").unwrap().as_str(),
            "http://cdn.example.com/game/v1/bundles/cube.bundle"
        );
    }

    #[test]
    fn test_absolute_ids_pass_through() {
        let base = server_url("http://cdn.example.com/").unwrap();
        let url = resolve_url(&base, "https://other.example.com/x.bundle").unwrap();
        assert_eq!(url.as_str(), "https://other.example.com/x.bundle");
    }

    #[test]
    fn test_bad_inputs() {
        assert!(server_url("not a url").is_err());
        let base = server_url("http://cdn.example.com/").unwrap();
        assert!(matches!(resolve_url(&base, " "), Err(UpdateError::UnexpectedAssetShape(_))));
        assert!(cache_file_name("bundles/").is_err());
        assert!(cache_file_name("..").is_err());
    }

    #[test]
    fn test_cache_names_are_distinct_and_readable() {
        let a = cache_file_name("bundles/a/cube.bundle").unwrap();
        let b = cache_file_name("bundles/b/cube.bundle").unwrap();
        assert_ne!(a, b);
        assert!(a.ends_with("-cube.bundle"));
        assert_eq!(a, cache_file_name("bundles/a/cube.bundle").unwrap());
    }

    #[test]
    fn test_catalog_ids() {
        assert!(validate_catalog_id("catalog_2024.1").is_ok());
        assert!(validate_catalog_id("../etc").is_err());
        assert!(validate_catalog_id("a/b").is_err());
        assert!(validate_catalog_id("").is_err());
    }
}
