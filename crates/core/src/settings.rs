//! Shared key/value store for probe results.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::quality::VideoQuality;

/// Cheaply cloneable string map shared between a session and its streams.
///
/// The platform glue may seed it from persistent preferences and read it
/// back with [`snapshot`](Self::snapshot).
#[derive(Debug, Clone, Default)]
pub struct Settings {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.entries.write().remove(key)
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries.read().clone()
    }
}

impl From<HashMap<String, String>> for Settings {
    fn from(entries: HashMap<String, String>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }
}

/// Key under which H.264 parameter sets for `quality` are cached.
pub fn h264_key(quality: &VideoQuality) -> String {
    format!(
        "h264-mr-{},{},{}",
        quality.framerate, quality.res_x, quality.res_y
    )
}
