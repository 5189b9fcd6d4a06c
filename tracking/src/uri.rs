//! Tracking URI dispatch: picks a backend from a URI scheme.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::{
    fs::FileStore,
    rest::RestStore,
    store::{RecordStore, TrackingBackend},
};

enum Resolved {
    Rest(RestStore),
    File(FileStore),
}

fn resolve(uri: &str) -> Result<Resolved> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Resolved::Rest(RestStore::new(uri)?));
    }
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Resolved::File(FileStore::new(path)));
    }
    if uri.contains("://") {
        bail!("unsupported tracking URI scheme: '{uri}'");
    }
    Ok(Resolved::File(FileStore::new(uri)))
}

/// Resolves a tracking URI to a run-tracking store. `http://` and
/// `https://` map to the REST store, `file://` and bare paths to the
/// file store.
pub fn store_for_uri(uri: &str) -> Result<Arc<dyn RecordStore>> {
    Ok(match resolve(uri)? {
        Resolved::Rest(store) => Arc::new(store),
        Resolved::File(store) => Arc::new(store),
    })
}

/// Resolves a tracking URI to a backend that also serves the model
/// registry. Same scheme rules as [`store_for_uri`].
pub fn backend_for_uri(uri: &str) -> Result<Arc<dyn TrackingBackend>> {
    Ok(match resolve(uri)? {
        Resolved::Rest(store) => Arc::new(store),
        Resolved::File(store) => Arc::new(store),
    })
}
