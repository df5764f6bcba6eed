/// Client context and dependency injection
use crate::{
    backend::{AuthProvider, DataStore, InMemoryBackend, Realtime, RealtimeClient, RestBackend},
    config::{BackendConfig, ClientConfig},
    error::{WallError, WallResult},
    prefs::Preferences,
};
use std::sync::Arc;

/// Context holding the backend handles shared by every view
#[derive(Clone)]
pub struct WallContext {
    pub config: Arc<ClientConfig>,
    pub store: Arc<dyn DataStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub realtime: Arc<dyn Realtime>,
    pub preferences: Arc<Preferences>,
}

impl WallContext {
    /// Create a context from configuration
    pub async fn new(config: ClientConfig) -> WallResult<Self> {
        // Validate configuration
        config.validate()?;

        // Create data directories if they don't exist
        Self::ensure_directories(&config).await?;

        let preferences = Arc::new(Preferences::load(&config.storage.preferences_file));

        match &config.backend {
            BackendConfig::Remote {
                base_url,
                anon_key,
                request_timeout_secs,
            } => {
                tracing::info!("Using hosted backend at {}", base_url);
                let rest = Arc::new(RestBackend::new(base_url, anon_key, *request_timeout_secs)?);
                let realtime = Arc::new(RealtimeClient::new(
                    base_url,
                    anon_key,
                    config.realtime.clone(),
                    rest.session_watch(),
                ));
                Ok(Self {
                    store: rest.clone(),
                    auth: rest,
                    realtime,
                    preferences,
                    config: Arc::new(config),
                })
            }
            BackendConfig::Memory => {
                tracing::info!("Using in-process backend");
                let memory = Arc::new(InMemoryBackend::new());
                Ok(Self::with_backend(config, memory, preferences))
            }
        }
    }

    /// Context over a single backend implementing every interface
    pub fn with_backend<B>(config: ClientConfig, backend: Arc<B>, preferences: Arc<Preferences>) -> Self
    where
        B: DataStore + AuthProvider + Realtime + 'static,
    {
        Self {
            config: Arc::new(config),
            store: backend.clone(),
            auth: backend.clone(),
            realtime: backend,
            preferences,
        }
    }

    /// In-process context with default settings and unsaved preferences
    pub fn in_memory(backend: Arc<InMemoryBackend>) -> Self {
        Self::with_backend(
            ClientConfig::in_memory(std::env::temp_dir().join("voice-wall")),
            backend,
            Arc::new(Preferences::ephemeral()),
        )
    }

    /// Ensure required directories exist
    async fn ensure_directories(config: &ClientConfig) -> WallResult<()> {
        let dir = &config.storage.data_directory;
        if !dir.exists() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                WallError::Config(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }
        Ok(())
    }
}
