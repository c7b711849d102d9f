use crate::error::UpdateError;
use crate::providers::{ContentLocation, LocatorRegistry};

/// Collect every location reachable from every key of every locator.
///
/// Nothing is filtered here: duplicates and already cached content are
/// left for the content service to handle. Locations without an id cannot
/// be fetched and are dropped.
pub fn resolve_all(registry: &dyn LocatorRegistry) -> Vec<ContentLocation> {
    let mut locations = Vec::new();

    for locator in registry.locators() {
        log::trace!("locator {}", locator.locator_id());
        for key in locator.keys() {
            let Some(found) = locator.locate(&key) else {
                continue;
            };
            for location in found {
                if location.id.trim().is_empty() {
                    let err = UpdateError::UnexpectedAssetShape(format!(
                        "key {:?} in locator {} resolved to a location without id",
                        key,
                        locator.locator_id()
                    ));
                    log::warn!("{}", err);
                    continue;
                }
                locations.push(location);
            }
        }
    }

    log::debug!("resolved {} content locations", locations.len());
    locations
}
