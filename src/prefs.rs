/// Locally persisted user preferences
///
/// Stored as a flat JSON object of string keys. Only the display name used
/// when commenting is kept today.
use crate::error::{WallError, WallResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Key under which the display name is stored
pub const DISPLAY_NAME_KEY: &str = "vw.display_name";

/// Display name used when none was given
pub const DEFAULT_DISPLAY_NAME: &str = "Guest";

/// Name recorded on a comment for the given input
pub fn display_name_or_default(name: &str) -> &str {
    match name.trim() {
        "" => DEFAULT_DISPLAY_NAME,
        trimmed => trimmed,
    }
}

pub struct Preferences {
    path: Option<PathBuf>,
    values: Mutex<BTreeMap<String, String>>,
    /// Held from update to file write so saves land in update order
    writer: tokio::sync::Mutex<()>,
}

impl Preferences {
    /// Load preferences from `path`; a missing or unreadable file yields
    /// empty preferences
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("Ignoring malformed preferences {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!("Cannot read preferences {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        Self {
            path: Some(path),
            values: Mutex::new(values),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Preferences that are never written to disk
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            values: Mutex::new(BTreeMap::new()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: &str) -> WallResult<()> {
        let _writer = self.writer.lock().await;
        let serialized = {
            let mut values = self.values.lock();
            values.insert(key.to_string(), value.to_string());
            serde_json::to_string_pretty(&*values)
                .map_err(|e| WallError::Config(format!("Cannot encode preferences: {}", e)))?
        };

        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serialized).await?;
        debug!("Saved preference {}", key);
        Ok(())
    }

    /// Display name last used, if any
    pub fn display_name(&self) -> Option<String> {
        self.get(DISPLAY_NAME_KEY)
    }

    /// Store the display name, substituting the default for a blank one;
    /// returns the name actually stored
    pub async fn set_display_name(&self, name: &str) -> WallResult<String> {
        let name = display_name_or_default(name);
        self.set(DISPLAY_NAME_KEY, name).await?;
        Ok(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_display_name_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("preferences.json");

        let prefs = Preferences::load(&path);
        assert!(prefs.display_name().is_none());
        assert_eq!(prefs.set_display_name("  Ada ").await.unwrap(), "Ada");

        let reloaded = Preferences::load(&path);
        assert_eq!(reloaded.display_name().as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn test_blank_name_becomes_guest() {
        let prefs = Preferences::ephemeral();
        assert_eq!(prefs.set_display_name("   ").await.unwrap(), "Guest");
        assert_eq!(prefs.display_name().as_deref(), Some("Guest"));
    }

    #[tokio::test]
    async fn test_overlapping_saves_keep_last_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preferences.json");
        let prefs = Arc::new(Preferences::load(&path));

        let saves = (0..20).map(|n| {
            let prefs = prefs.clone();
            tokio::spawn(async move { prefs.set_display_name(&format!("name{}", n)).await })
        });
        for save in join_all(saves).await {
            save.unwrap().unwrap();
        }

        let in_memory = prefs.display_name();
        assert!(in_memory.is_some());
        assert_eq!(Preferences::load(&path).display_name(), in_memory);
    }

    #[test]
    fn test_malformed_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("preferences.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Preferences::load(&path).get(DISPLAY_NAME_KEY).is_none());
    }
}
