/// Configuration management for the Voice Wall client
use crate::error::{WallError, WallResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    pub feed: FeedConfig,
    pub realtime: RealtimeConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Which backend implementation to talk to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BackendConfig {
    /// Hosted backend reached over HTTP and websocket
    Remote {
        base_url: String,
        anon_key: String,
        request_timeout_secs: u64,
    },
    /// In-process store, nothing leaves the machine
    Memory,
}

/// Feed and reaction behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Maximum number of posts fetched on a full reload
    pub post_limit: usize,
    /// Cooldown after a reaction write settles, in milliseconds
    pub reaction_cooldown_ms: u64,
}

/// Realtime change stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub reconnect_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Buffer size for each subscription channel
    pub buffer_size: usize,
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub preferences_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            post_limit: 100,
            reaction_cooldown_ms: 200,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: 5,
            heartbeat_interval_secs: 30,
            buffer_size: 256,
        }
    }
}

impl FeedConfig {
    pub fn reaction_cooldown(&self) -> Duration {
        Duration::from_millis(self.reaction_cooldown_ms)
    }
}

impl ClientConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> WallResult<Self> {
        dotenv::dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_vars<F>(var: F) -> WallResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend_kind = var("VOICE_WALL_BACKEND").unwrap_or_else(|| "remote".to_string());
        let backend = match backend_kind.as_str() {
            "memory" => BackendConfig::Memory,
            "remote" => {
                let base_url = var("VOICE_WALL_BACKEND_URL").ok_or_else(|| {
                    WallError::Config("VOICE_WALL_BACKEND_URL is required".to_string())
                })?;
                let anon_key = var("VOICE_WALL_ANON_KEY").ok_or_else(|| {
                    WallError::Config("VOICE_WALL_ANON_KEY is required".to_string())
                })?;
                let request_timeout_secs = var("VOICE_WALL_REQUEST_TIMEOUT_SECS")
                    .unwrap_or_else(|| "30".to_string())
                    .parse()
                    .unwrap_or(30);
                BackendConfig::Remote {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    anon_key,
                    request_timeout_secs,
                }
            }
            other => {
                return Err(WallError::Config(format!(
                    "Unknown backend '{}', expected 'remote' or 'memory'",
                    other
                )))
            }
        };

        let post_limit = var("VOICE_WALL_POST_LIMIT")
            .unwrap_or_else(|| "100".to_string())
            .parse()
            .map_err(|_| WallError::Config("Invalid post limit".to_string()))?;
        let reaction_cooldown_ms = var("VOICE_WALL_REACTION_COOLDOWN_MS")
            .unwrap_or_else(|| "200".to_string())
            .parse()
            .unwrap_or(200);

        let reconnect_interval_secs = var("VOICE_WALL_REALTIME_RECONNECT_SECS")
            .unwrap_or_else(|| "5".to_string())
            .parse()
            .unwrap_or(5);
        let heartbeat_interval_secs = var("VOICE_WALL_REALTIME_HEARTBEAT_SECS")
            .unwrap_or_else(|| "30".to_string())
            .parse()
            .unwrap_or(30);

        let data_directory: PathBuf = var("VOICE_WALL_DATA_DIRECTORY")
            .unwrap_or_else(|| "./data".to_string())
            .into();
        let preferences_file = var("VOICE_WALL_PREFERENCES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_directory.join("preferences.json"));

        let level = var("VOICE_WALL_LOG").unwrap_or_else(|| "voice_wall=debug".to_string());

        Ok(ClientConfig {
            backend,
            feed: FeedConfig {
                post_limit,
                reaction_cooldown_ms,
            },
            realtime: RealtimeConfig {
                reconnect_interval_secs,
                heartbeat_interval_secs,
                ..RealtimeConfig::default()
            },
            storage: StorageConfig {
                data_directory,
                preferences_file,
            },
            logging: LoggingConfig { level },
        })
    }

    /// Configuration for the in-process backend rooted at `data_directory`
    pub fn in_memory(data_directory: PathBuf) -> Self {
        Self {
            backend: BackendConfig::Memory,
            feed: FeedConfig::default(),
            realtime: RealtimeConfig::default(),
            storage: StorageConfig {
                preferences_file: data_directory.join("preferences.json"),
                data_directory,
            },
            logging: LoggingConfig {
                level: "voice_wall=info".to_string(),
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> WallResult<()> {
        if let BackendConfig::Remote {
            base_url, anon_key, ..
        } = &self.backend
        {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(WallError::Config(format!(
                    "Backend URL must be http(s): {}",
                    base_url
                )));
            }
            if anon_key.trim().is_empty() {
                return Err(WallError::Config("Anon key cannot be empty".to_string()));
            }
        }

        if self.feed.post_limit == 0 {
            return Err(WallError::Config("Post limit must be positive".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::in_memory(PathBuf::from("/tmp/vw"));
        assert_eq!(config.feed.post_limit, 100);
        assert_eq!(config.feed.reaction_cooldown(), Duration::from_millis(200));
        assert_eq!(config.realtime.reconnect_interval_secs, 5);
        assert_eq!(
            config.storage.preferences_file,
            PathBuf::from("/tmp/vw/preferences.json")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_remote() {
        let mut config = ClientConfig::in_memory(PathBuf::from("/tmp/vw"));
        config.backend = BackendConfig::Remote {
            base_url: "ftp://example.com".to_string(),
            anon_key: "key".to_string(),
            request_timeout_secs: 30,
        };
        assert!(matches!(config.validate(), Err(WallError::Config(_))));

        config.backend = BackendConfig::Remote {
            base_url: "https://example.supabase.co".to_string(),
            anon_key: "  ".to_string(),
            request_timeout_secs: 30,
        };
        assert!(matches!(config.validate(), Err(WallError::Config(_))));
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let owned: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| {
            owned
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn test_remote_requires_url_and_key() {
        let missing_url = ClientConfig::from_vars(lookup(&[("VOICE_WALL_ANON_KEY", "anon")]));
        assert!(matches!(missing_url, Err(WallError::Config(_))));

        let missing_key = ClientConfig::from_vars(lookup(&[(
            "VOICE_WALL_BACKEND_URL",
            "https://wall.example.co",
        )]));
        assert!(matches!(missing_key, Err(WallError::Config(_))));
    }

    #[test]
    fn test_from_vars_remote() {
        let config = ClientConfig::from_vars(lookup(&[
            ("VOICE_WALL_BACKEND_URL", "https://wall.example.co/"),
            ("VOICE_WALL_ANON_KEY", "anon"),
            ("VOICE_WALL_POST_LIMIT", "25"),
            ("VOICE_WALL_DATA_DIRECTORY", "/var/lib/vw"),
        ]))
        .unwrap();

        match &config.backend {
            BackendConfig::Remote {
                base_url,
                request_timeout_secs,
                ..
            } => {
                assert_eq!(base_url, "https://wall.example.co");
                assert_eq!(*request_timeout_secs, 30);
            }
            BackendConfig::Memory => panic!("expected remote backend"),
        }
        assert_eq!(config.feed.post_limit, 25);
        assert_eq!(
            config.storage.preferences_file,
            PathBuf::from("/var/lib/vw/preferences.json")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_memory_and_unknown() {
        let config = ClientConfig::from_vars(lookup(&[("VOICE_WALL_BACKEND", "memory")])).unwrap();
        assert!(matches!(config.backend, BackendConfig::Memory));

        let unknown = ClientConfig::from_vars(lookup(&[("VOICE_WALL_BACKEND", "sqlite")]));
        assert!(matches!(unknown, Err(WallError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let mut config = ClientConfig::in_memory(PathBuf::from("/tmp/vw"));
        config.feed.post_limit = 0;
        assert!(config.validate().is_err());
    }
}
