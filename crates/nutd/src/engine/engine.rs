use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::entries::ConfigEntries;
use super::entries::ConfigEntriesError;
use super::integration::FromIntegrationReceiver;
use super::integration::FromIntegrationSender;
use super::integration::Host;
use super::integration::Integration;
use super::integration::IntegrationContext;
use super::integration::SetupError;
use super::integration::UnloadError;
use super::message::FromIntegrationMessage;
use super::state::State;
use super::state::UpsState;
use crate::config::Config;
use crate::config::ConfigError;

/// Capacity for the integration→engine message channel
/// Provides backpressure when integrations send faster than the engine can process
const FROM_INTEGRATION_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Entry not found: {0}")]
    UnknownEntry(String),

    #[error("No integration registered for domain {0}")]
    NoIntegration(String),

    #[error("Entry {0} is already loaded")]
    AlreadyLoaded(String),

    #[error("Entry {0} is not loaded")]
    NotLoaded(String),

    #[error("Failed to unload entry {0}")]
    UnloadFailed(String),

    #[error("Setup of entry {entry_id} failed: {source}")]
    Setup {
        entry_id: String,
        #[source]
        source: SetupError,
    },

    #[error(transparent)]
    Unload(#[from] UnloadError),

    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Read-only view of the engine state, cheap to clone
#[derive(Clone)]
pub struct StateReader {
    state: Arc<ArcSwap<State>>,
}

impl StateReader {
    /// Clones the `Arc` (atomic refcount bump), essentially free.
    pub fn snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }
}

/// nutd engine
///
/// Owns the config entries and the integrations that serve them, drives entry
/// setup, reload and unload, and maintains a view of the world with State.
pub struct Engine {
    /// Centralized state snapshot (readers load the Arc, writer stores a new one)
    state: Arc<ArcSwap<State>>,

    config_entries: Arc<ConfigEntries>,

    /// Integrations by domain
    integrations: HashMap<String, Box<dyn Integration>>,

    /// Ids of entries whose setup succeeded
    loaded: BTreeSet<String>,

    /// Map of entity_id -> integration name
    entities: BTreeMap<String, String>,

    /// Receive messages from integrations (events)
    message_rx: FromIntegrationReceiver,

    /// Sender for integrations to report events back to the engine
    message_tx: FromIntegrationSender,

    reload_rx: mpsc::UnboundedReceiver<String>,
    reload_tx: mpsc::UnboundedSender<String>,
}

impl Engine {
    /// Create a new Engine instance
    pub fn new() -> Self {
        let (message_tx, message_rx) = mpsc::channel(FROM_INTEGRATION_CHANNEL_SIZE);
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(ArcSwap::new(Arc::default())),
            config_entries: Arc::new(ConfigEntries::new()),
            integrations: HashMap::new(),
            loaded: BTreeSet::new(),
            entities: BTreeMap::new(),
            message_rx,
            message_tx,
            reload_rx,
            reload_tx,
        }
    }

    /// Register integrations from configuration
    ///
    /// Every registered factory is offered the config; factories for domains
    /// with no entries return nothing.
    pub fn register_integrations_from_config(&mut self, cfg: &Config) {
        let ctx = IntegrationContext { config: cfg };
        for constr in super::integration::REGISTRY {
            let integration = match constr(&ctx) {
                Ok(Some(i)) => i,
                Err(e) => {
                    error!("failed to create integration: {:#}", e);
                    continue;
                }
                Ok(None) => continue,
            };
            self.register_integration(integration);
        }
    }

    /// Register an integration with the engine
    pub fn register_integration(&mut self, integration: Box<dyn Integration>) {
        let domain = integration.domain().to_string();
        info!("Registered integration: {}", domain);
        self.integrations.insert(domain, integration);
    }

    /// Add every entry listed in the config file
    pub fn add_entries_from_config(&self, cfg: &Config) -> Result<usize, EngineError> {
        for (entry_id, entry) in &cfg.entries {
            self.config_entries.add(entry.to_config_entry(entry_id)?)?;
        }
        Ok(cfg.entries.len())
    }

    pub fn config_entries(&self) -> Arc<ConfigEntries> {
        self.config_entries.clone()
    }

    /// Handle given to integrations for the duration of a setup/unload call
    pub fn host(&self) -> Host {
        Host::new(
            self.config_entries.clone(),
            self.message_tx.clone(),
            self.reload_tx.clone(),
        )
    }

    pub fn is_loaded(&self, entry_id: &str) -> bool {
        self.loaded.contains(entry_id)
    }

    /// Get a snapshot of the current engine state.
    pub fn state_snapshot(&self) -> Arc<State> {
        self.state.load_full()
    }

    pub fn state_reader(&self) -> StateReader {
        StateReader {
            state: self.state.clone(),
        }
    }

    /// Ids of all entities currently registered by integrations
    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    /// Set up one config entry through its domain's integration
    pub async fn setup_entry(&mut self, entry_id: &str) -> Result<(), EngineError> {
        if self.loaded.contains(entry_id) {
            return Err(EngineError::AlreadyLoaded(entry_id.to_string()));
        }

        let entry = self
            .config_entries
            .get(entry_id)
            .ok_or_else(|| EngineError::UnknownEntry(entry_id.to_string()))?;
        let integration = self
            .integrations
            .get(&entry.domain)
            .ok_or_else(|| EngineError::NoIntegration(entry.domain.clone()))?;

        info!("[{}] Setting up {} entry '{}'", entry_id, entry.domain, entry.title);
        integration
            .setup_entry(&self.host(), &entry)
            .await
            .map_err(|source| EngineError::Setup {
                entry_id: entry_id.to_string(),
                source,
            })?;

        self.loaded.insert(entry_id.to_string());
        info!("[{}] Entry setup complete", entry_id);
        Ok(())
    }

    /// Unload one config entry; returns whether the integration fully unloaded it
    pub async fn unload_entry(&mut self, entry_id: &str) -> Result<bool, EngineError> {
        if !self.loaded.contains(entry_id) {
            return Err(EngineError::NotLoaded(entry_id.to_string()));
        }

        let entry = self
            .config_entries
            .get(entry_id)
            .ok_or_else(|| EngineError::UnknownEntry(entry_id.to_string()))?;
        let integration = self
            .integrations
            .get(&entry.domain)
            .ok_or_else(|| EngineError::NoIntegration(entry.domain.clone()))?;

        let unload_ok = integration.unload_entry(&self.host(), &entry).await?;
        if unload_ok {
            self.loaded.remove(entry_id);
            info!("[{}] Entry unloaded", entry_id);
        } else {
            warn!("[{}] Entry did not unload cleanly", entry_id);
        }
        Ok(unload_ok)
    }

    /// Unload (if loaded) and set the entry up again
    pub async fn reload_entry(&mut self, entry_id: &str) -> Result<(), EngineError> {
        info!("[{}] Reloading entry", entry_id);
        if self.loaded.contains(entry_id) && !self.unload_entry(entry_id).await? {
            return Err(EngineError::UnloadFailed(entry_id.to_string()));
        }

        // Apply the removals before the new entities arrive
        self.drain_messages();
        self.setup_entry(entry_id).await
    }

    /// Set up every enabled entry; failures are logged and do not stop the rest
    ///
    /// Returns the number of entries loaded.
    pub async fn setup_all(&mut self) -> usize {
        for entry_id in self.config_entries.entry_ids() {
            let Some(entry) = self.config_entries.get(&entry_id) else {
                continue;
            };
            if entry.disabled {
                info!("[{}] Entry is disabled, skipping", entry_id);
                continue;
            }
            if let Err(e) = self.setup_entry(&entry_id).await {
                error!("[{}] {}", entry_id, e);
            }
        }
        self.loaded.len()
    }

    /// Run the engine's main event loop until `shutdown` completes
    ///
    /// Processes incoming events from integrations and reload requests.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        info!("Engine starting");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(msg) = self.message_rx.recv() => self.handle_event(msg),
                Some(entry_id) = self.reload_rx.recv() => {
                    if let Err(e) = self.reload_entry(&entry_id).await {
                        error!("[{}] Reload failed: {}", entry_id, e);
                    }
                }
            }
        }

        info!("Engine shutting down");
    }

    /// Unload every loaded entry
    pub async fn shutdown(&mut self) {
        let loaded: Vec<String> = self.loaded.iter().cloned().collect();
        for entry_id in loaded {
            if let Err(e) = self.unload_entry(&entry_id).await {
                error!("[{}] Error unloading entry: {}", entry_id, e);
            }
        }
        self.drain_messages();
    }

    /// Apply every message already queued by integrations
    pub fn drain_messages(&mut self) {
        while let Ok(msg) = self.message_rx.try_recv() {
            self.handle_event(msg);
        }
    }

    fn update_state(&self, f: impl FnOnce(&mut State)) {
        let mut state = State::clone(&self.state.load());
        f(&mut state);
        self.state.store(Arc::new(state));
    }

    /// Handle an event from an integration
    fn handle_event(&mut self, msg: FromIntegrationMessage) {
        match msg {
            FromIntegrationMessage::DeviceRegistered { device } => {
                info!(
                    "Device registered: {} ({} {})",
                    device.name,
                    device.manufacturer.as_deref().unwrap_or("unknown"),
                    device.model.as_deref().unwrap_or("unknown")
                );
                self.update_state(|state| {
                    state.devices.insert(device.id.clone(), device);
                });
            }
            FromIntegrationMessage::EntityDiscovered {
                entity_id,
                integration_name,
                device_id,
            } => {
                info!(
                    "Entity discovered: {} (from {})",
                    entity_id, integration_name
                );

                if let Some(device_id) = device_id {
                    self.update_state(|state| {
                        if let Some(device) = state.devices.get_mut(&device_id) {
                            device.add_entity(entity_id.clone());
                        }
                    });
                }
                self.entities.insert(entity_id, integration_name);
            }
            FromIntegrationMessage::EntityRemoved { entity_id } => {
                info!("Entity removed: {}", entity_id);

                self.update_state(|state| {
                    state.ups.remove(&entity_id);
                    for device in state.devices.values_mut() {
                        device.entity_ids.retain(|id| id != &entity_id);
                    }
                    state.devices.retain(|_, device| !device.entity_ids.is_empty());
                });
                self.entities.remove(&entity_id);
            }
            FromIntegrationMessage::UpsStatusChanged { entity_id, status } => {
                let ups_state = UpsState {
                    available: status.is_some(),
                    status: status.unwrap_or_default(),
                };

                let was_available = self
                    .state
                    .load()
                    .ups
                    .get(&entity_id)
                    .map(|s| s.available);
                match (was_available, ups_state.available) {
                    (Some(true), false) => warn!("UPS {} became unavailable", entity_id),
                    (Some(false), true) => info!("UPS {} is available again", entity_id),
                    _ => {}
                }
                debug!(
                    "UPS state changed: {} -> {:?}",
                    entity_id,
                    ups_state.ups_status()
                );

                self.update_state(|state| {
                    state.ups.insert(entity_id, ups_state);
                });
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::engine::device::Device;
    use crate::engine::entries::ConfigEntry;
    use crate::engine::entries::ListenerHandle;

    /// Integration that records calls and reloads its entries on option changes
    #[derive(Default)]
    struct FakeIntegration {
        failing: HashSet<String>,
        setups: Arc<AtomicUsize>,
        unloads: Arc<AtomicUsize>,
        listeners: Mutex<HashMap<String, ListenerHandle>>,
    }

    #[async_trait]
    impl Integration for FakeIntegration {
        fn domain(&self) -> &str {
            "fake"
        }

        async fn setup_entry(&self, host: &Host, entry: &ConfigEntry) -> Result<(), SetupError> {
            if self.failing.contains(&entry.entry_id) {
                return Err(SetupError::NotReady("no data".to_string()));
            }
            self.setups.fetch_add(1, Ordering::SeqCst);

            let reload = host.reload_sender();
            let handle = host.config_entries().add_update_listener(
                &entry.entry_id,
                Arc::new(move |entry: &ConfigEntry| reload.request(&entry.entry_id)),
            );
            self.listeners
                .lock()
                .unwrap()
                .insert(entry.entry_id.clone(), handle);
            Ok(())
        }

        async fn unload_entry(
            &self,
            host: &Host,
            entry: &ConfigEntry,
        ) -> Result<bool, UnloadError> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            let handle = self
                .listeners
                .lock()
                .unwrap()
                .remove(&entry.entry_id)
                .ok_or_else(|| UnloadError::NotLoaded(entry.entry_id.clone()))?;
            host.config_entries().remove_listener(&handle);
            Ok(true)
        }
    }

    fn engine_with(
        entries: Vec<ConfigEntry>,
        failing: &[&str],
    ) -> (Engine, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let integration = FakeIntegration {
            failing: failing.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let setups = integration.setups.clone();
        let unloads = integration.unloads.clone();

        let mut engine = Engine::new();
        engine.register_integration(Box::new(integration));
        for entry in entries {
            engine.config_entries().add(entry).unwrap();
        }
        (engine, setups, unloads)
    }

    #[tokio::test]
    async fn test_setup_all_skips_disabled_and_failed() {
        let mut disabled = ConfigEntry::new("c", "fake", "C");
        disabled.disabled = true;

        let (mut engine, setups, _) = engine_with(
            vec![
                ConfigEntry::new("a", "fake", "A"),
                ConfigEntry::new("b", "fake", "B"),
                disabled,
                ConfigEntry::new("d", "other", "D"),
            ],
            &["b"],
        );

        assert_eq!(engine.setup_all().await, 1);
        assert!(engine.is_loaded("a"));
        assert!(!engine.is_loaded("b"));
        assert!(!engine.is_loaded("c"));
        assert!(!engine.is_loaded("d"));
        assert_eq!(setups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_setup_errors() {
        let (mut engine, _, _) = engine_with(vec![ConfigEntry::new("a", "fake", "A")], &[]);

        assert!(matches!(
            engine.setup_entry("missing").await,
            Err(EngineError::UnknownEntry(_))
        ));
        engine.setup_entry("a").await.unwrap();
        assert!(matches!(
            engine.setup_entry("a").await,
            Err(EngineError::AlreadyLoaded(_))
        ));
        assert!(matches!(
            engine.unload_entry("missing").await,
            Err(EngineError::NotLoaded(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_options_change_reloads_entry() {
        let (mut engine, setups, unloads) = engine_with(
            vec![ConfigEntry::new("a", "fake", "A").with_options(
                json!({"scan_interval": 60}).as_object().cloned().unwrap(),
            )],
            &[],
        );
        engine.setup_all().await;

        let entries = engine.config_entries();
        entries
            .update_options("a", json!({"scan_interval": 10}).as_object().cloned().unwrap())
            .unwrap();

        engine.run(tokio::time::sleep(Duration::from_secs(1))).await;

        assert_eq!(setups.load(Ordering::SeqCst), 2);
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
        assert!(engine.is_loaded("a"));
        // The old listener is gone, the new one is registered
        assert_eq!(entries.listener_count("a"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_unloads_everything() {
        let (mut engine, _, unloads) = engine_with(
            vec![
                ConfigEntry::new("a", "fake", "A"),
                ConfigEntry::new("b", "fake", "B"),
            ],
            &[],
        );
        engine.setup_all().await;
        engine.shutdown().await;

        assert_eq!(unloads.load(Ordering::SeqCst), 2);
        assert!(!engine.is_loaded("a"));
        assert!(!engine.is_loaded("b"));
    }

    #[tokio::test]
    async fn test_ups_state_messages() {
        let mut engine = Engine::new();
        let tx = engine.host().to_engine();

        let mut device = Device::new("Eaton_5E_G123".to_string(), "rack".to_string());
        device.manufacturer = Some("Eaton".to_string());
        tx.send(FromIntegrationMessage::DeviceRegistered { device })
            .await
            .unwrap();
        tx.send(FromIntegrationMessage::EntityDiscovered {
            entity_id: "sensor.rack_status".to_string(),
            integration_name: "nut".to_string(),
            device_id: Some("Eaton_5E_G123".to_string()),
        })
        .await
        .unwrap();
        tx.send(FromIntegrationMessage::UpsStatusChanged {
            entity_id: "sensor.rack_status".to_string(),
            status: Some(BTreeMap::from([(
                "ups.status".to_string(),
                "OL".to_string(),
            )])),
        })
        .await
        .unwrap();
        engine.drain_messages();

        let state = engine.state_snapshot();
        let ups = &state.ups["sensor.rack_status"];
        assert!(ups.available);
        assert_eq!(ups.ups_status(), Some("OL"));
        assert_eq!(
            state.devices["Eaton_5E_G123"].entity_ids,
            vec!["sensor.rack_status"]
        );
        assert_eq!(engine.entity_ids(), vec!["sensor.rack_status"]);

        tx.send(FromIntegrationMessage::UpsStatusChanged {
            entity_id: "sensor.rack_status".to_string(),
            status: None,
        })
        .await
        .unwrap();
        engine.drain_messages();
        let state = engine.state_reader().snapshot();
        assert!(!state.ups["sensor.rack_status"].available);
        assert!(state.ups["sensor.rack_status"].status.is_empty());

        tx.send(FromIntegrationMessage::EntityRemoved {
            entity_id: "sensor.rack_status".to_string(),
        })
        .await
        .unwrap();
        engine.drain_messages();
        let state = engine.state_snapshot();
        assert!(state.ups.is_empty());
        assert!(state.devices.is_empty());
        assert!(engine.entity_ids().is_empty());
    }
}
