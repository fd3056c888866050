use std::sync::Arc;

use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::sync::mpsc;
use tracing::warn;

use super::entries::ConfigEntries;
use super::entries::ConfigEntriesError;
use super::entries::ConfigEntry;
use super::message::FromIntegrationMessage;
use crate::config::Config;

/// Channel types for messages FROM integrations TO the engine
/// These are bounded channels to provide backpressure
pub type FromIntegrationSender = mpsc::Sender<FromIntegrationMessage>;
pub type FromIntegrationReceiver = mpsc::Receiver<FromIntegrationMessage>;

/// Result type for integration factory functions
pub type IntegrationFactoryResult = anyhow::Result<Option<Box<dyn Integration>>>;

pub struct IntegrationContext<'a> {
    pub config: &'a Config,
}

#[distributed_slice]
pub static REGISTRY: [fn(&IntegrationContext) -> IntegrationFactoryResult];

/// Why an entry could not be set up
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Entry data or options are malformed; retrying will not help
    #[error("invalid config entry: {0}")]
    InvalidData(String),

    /// The device could not be reached or returned no data
    #[error("config entry not ready: {0}")]
    NotReady(String),

    #[error("engine is no longer accepting messages")]
    EngineClosed,

    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),
}

#[derive(Debug, thiserror::Error)]
pub enum UnloadError {
    #[error("config entry {0} is not loaded")]
    NotLoaded(String),
}

/// Asks the engine to reload a config entry
#[derive(Debug, Clone)]
pub struct ReloadSender {
    tx: mpsc::UnboundedSender<String>,
}

impl ReloadSender {
    pub fn request(&self, entry_id: &str) {
        if self.tx.send(entry_id.to_string()).is_err() {
            warn!("Engine gone, dropping reload request for {}", entry_id);
        }
    }
}

/// Engine services available to integrations during setup and unload
#[derive(Clone)]
pub struct Host {
    config_entries: Arc<ConfigEntries>,
    to_engine: FromIntegrationSender,
    reload: ReloadSender,
}

impl Host {
    pub fn new(
        config_entries: Arc<ConfigEntries>,
        to_engine: FromIntegrationSender,
        reload_tx: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            config_entries,
            to_engine,
            reload: ReloadSender { tx: reload_tx },
        }
    }

    pub fn config_entries(&self) -> &ConfigEntries {
        &self.config_entries
    }

    /// Sender for reporting entity events back to the engine
    pub fn to_engine(&self) -> FromIntegrationSender {
        self.to_engine.clone()
    }

    pub fn reload_sender(&self) -> ReloadSender {
        self.reload.clone()
    }
}

/// Integration trait that all integrations must implement
///
/// One integration instance serves every config entry of its domain.
#[async_trait]
pub trait Integration: Send + Sync {
    /// The config entry domain this integration handles (e.g. "nut")
    fn domain(&self) -> &str;

    /// Set up one config entry
    ///
    /// On success the entry's runtime data is stored and its entities are
    /// reporting to the engine.
    async fn setup_entry(&self, host: &Host, entry: &ConfigEntry) -> Result<(), SetupError>;

    /// Unload one config entry
    ///
    /// Returns whether every platform was torn down; runtime data is only
    /// released when it was.
    async fn unload_entry(&self, host: &Host, entry: &ConfigEntry) -> Result<bool, UnloadError>;
}
