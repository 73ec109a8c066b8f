//! Storage settings resolution.
//!
//! Settings are resolved once at the start of a run and handed to the
//! reconstructor explicitly. Layers, first usable one wins:
//!
//! 1. settings stored by the deployment in its own data source
//! 2. fallback settings supplied by the caller
//! 3. database storage

use crate::types::{StorageMode, StorageSettings};
use tracing::{debug, warn};

/// Picks the first usable storage settings layer.
///
/// A filesystem layer without a storage root is not usable.
pub fn resolve_storage_settings(
    primary: Option<StorageSettings>,
    fallback: Option<StorageSettings>,
) -> StorageSettings {
    for (layer, candidate) in [("data source", primary), ("fallback", fallback)] {
        let Some(settings) = candidate else {
            continue;
        };
        if settings.mode == StorageMode::Filesystem && settings.root.is_none() {
            warn!(
                "Ignoring {} storage settings: filesystem mode without a storage root",
                layer
            );
            continue;
        }
        debug!("Using {} storage settings: {:?}", layer, settings);
        return settings;
    }
    StorageSettings::default()
}
