use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DOMAIN;
use super::client::ClientFactory;
use super::client::NutClient;
use super::config::EntryData;
use super::config::EntryOptions;
use super::config::migrate_options;
use super::data::NutData;
use super::sensor;
use super::sensor::DeviceInfo;
use super::status;
use super::status::Status;
use crate::engine::ConfigEntry;
use crate::engine::Coordinator;
use crate::engine::EntryStore;
use crate::engine::Host;
use crate::engine::Integration;
use crate::engine::ListenerHandle;
use crate::engine::PlatformHandle;
use crate::engine::SetupError;
use crate::engine::UnloadError;
use crate::engine::UpdateFailed;
use crate::engine::UpdateMethod;

/// Upper bound on one poll, including waiting for a blocking worker
const UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

const COORDINATOR_NAME: &str = "NUT resource status";

/// Shared handle to an entry's fetcher; only locked on blocking workers
pub type SharedNutData<C> = Arc<Mutex<NutData<C>>>;

/// Everything kept for one loaded NUT entry
pub struct NutRuntimeData<C: NutClient> {
    pub coordinator: Coordinator<Status>,
    pub data: SharedNutData<C>,
    pub unique_id: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    undo_update_listener: ListenerHandle,
    platforms: Vec<PlatformHandle>,
}

/// Coordinator update method: runs the blocking fetch on a worker thread
struct NutUpdater<C: NutClient> {
    data: SharedNutData<C>,
    timeout: Duration,
}

#[async_trait]
impl<C: NutClient> UpdateMethod<Status> for NutUpdater<C> {
    async fn update(&self) -> Result<Status, UpdateFailed> {
        let data = self.data.clone();
        let job = tokio::task::spawn_blocking(move || -> Result<Option<Status>, UpdateFailed> {
            let mut data = data
                .lock()
                .map_err(|_| UpdateFailed::new("NUT data lock poisoned"))?;
            Ok(data.update().cloned())
        });

        // On timeout the worker keeps running; the client call can't be interrupted
        let status = tokio::time::timeout(self.timeout, job)
            .await
            .map_err(|_| UpdateFailed::new("Timed out fetching UPS state"))?
            .map_err(|e| UpdateFailed::new(format!("NUT update task failed: {}", e)))??;

        status
            .filter(|s| !s.is_empty())
            .ok_or_else(|| UpdateFailed::new("Error fetching UPS state"))
    }
}

/// Network UPS Tools integration
///
/// Polls a NUT server per config entry and exposes the UPS status as a sensor.
pub struct NutIntegration<F: ClientFactory> {
    factory: F,
    store: EntryStore<NutRuntimeData<F::Client>>,
}

impl<F: ClientFactory> NutIntegration<F> {
    pub fn new(factory: F, store: EntryStore<NutRuntimeData<F::Client>>) -> Self {
        Self { factory, store }
    }

    pub fn store(&self) -> &EntryStore<NutRuntimeData<F::Client>> {
        &self.store
    }
}

#[async_trait]
impl<F: ClientFactory> Integration for NutIntegration<F> {
    fn domain(&self) -> &str {
        DOMAIN
    }

    async fn setup_entry(&self, host: &Host, entry: &ConfigEntry) -> Result<(), SetupError> {
        let entry_id = entry.entry_id.as_str();

        // Strip out the stale resources option
        let migrated_entry;
        let entry = match migrate_options(&entry.options) {
            Some(migrated) => {
                info!("[{}] Removing deprecated resources option", entry_id);
                host.config_entries()
                    .update_options(entry_id, migrated.clone())?;
                migrated_entry = entry.clone().with_options(migrated);
                &migrated_entry
            }
            None => entry,
        };

        let data: EntryData = entry
            .parse_data()
            .map_err(|e| SetupError::InvalidData(e.to_string()))?;
        let options: EntryOptions = entry
            .parse_options()
            .map_err(|e| SetupError::InvalidData(e.to_string()))?;
        if options.scan_interval == 0 {
            return Err(SetupError::InvalidData(
                "scan_interval must be at least 1 second".to_string(),
            ));
        }

        let client = self.factory.create(&data);
        let nut_data: SharedNutData<F::Client> = Arc::new(Mutex::new(NutData::new(
            data.host.clone(),
            data.alias.clone(),
            client,
        )));

        let coordinator = Coordinator::new(
            COORDINATOR_NAME,
            Duration::from_secs(options.scan_interval),
            Arc::new(NutUpdater {
                data: nut_data.clone(),
                timeout: UPDATE_TIMEOUT,
            }),
        );

        // Fetch initial data so we have data when entities subscribe
        let status = coordinator
            .first_refresh()
            .await
            .map_err(|e| SetupError::NotReady(e.to_string()))?;

        debug!("[{}] NUT Sensors Available: {:?}", entry_id, status);

        let reload = host.reload_sender();
        let undo_update_listener = host.config_entries().add_update_listener(
            entry_id,
            Arc::new(move |entry: &ConfigEntry| reload.request(&entry.entry_id)),
        );

        let unique_id = status::unique_id(&status).unwrap_or_else(|| entry_id.to_string());
        let manufacturer = status::manufacturer(&status).map(String::from);
        let model = status::model(&status).map(String::from);
        let firmware = status::firmware(&status).map(String::from);

        let name = {
            let nut_data = nut_data.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ups_list) = nut_data.ups_list() {
                debug!("[{}] UPS devices on {}: {:?}", entry_id, data.host, ups_list);
            }
            nut_data
                .name()
                .map(String::from)
                .unwrap_or_else(|| entry.title.clone())
        };

        coordinator.start();

        let device_info = DeviceInfo {
            unique_id: unique_id.clone(),
            name,
            manufacturer: manufacturer.clone(),
            model: model.clone(),
            firmware: firmware.clone(),
        };
        let platform = match sensor::setup_entry(
            entry_id,
            &device_info,
            &coordinator,
            host.to_engine(),
        )
        .await
        {
            Ok(platform) => platform,
            Err(e) => {
                host.config_entries().remove_listener(&undo_update_listener);
                coordinator.shutdown();
                return Err(e);
            }
        };

        info!(
            "[{}] NUT entry ready: {} (polling every {}s)",
            entry_id, unique_id, options.scan_interval
        );

        self.store
            .insert(
                entry_id,
                NutRuntimeData {
                    coordinator,
                    data: nut_data,
                    unique_id,
                    manufacturer,
                    model,
                    firmware,
                    undo_update_listener,
                    platforms: vec![platform],
                },
            )
            .await;

        Ok(())
    }

    async fn unload_entry(&self, host: &Host, entry: &ConfigEntry) -> Result<bool, UnloadError> {
        let entry_id = entry.entry_id.as_str();

        let (platforms, undo_update_listener) = {
            let mut store = self.store.lock().await;
            let runtime = store
                .get_mut(entry_id)
                .ok_or_else(|| UnloadError::NotLoaded(entry_id.to_string()))?;
            (
                std::mem::take(&mut runtime.platforms),
                runtime.undo_update_listener.clone(),
            )
        };

        let to_engine = host.to_engine();
        let mut failed = Vec::new();
        for mut platform in platforms {
            if !platform.unload(&to_engine).await {
                warn!(
                    "[{}] Failed to unload platform {}, still registered: {:?}",
                    entry_id,
                    platform.platform(),
                    platform.entity_ids()
                );
                failed.push(platform);
            }
        }

        host.config_entries().remove_listener(&undo_update_listener);

        let unload_ok = failed.is_empty();
        if unload_ok {
            if let Some(runtime) = self.store.remove(entry_id).await {
                runtime.coordinator.shutdown();
            }
        } else if let Some(runtime) = self.store.lock().await.get_mut(entry_id) {
            // Keep what could not be torn down so the next unload retries it
            runtime.platforms = failed;
        }

        Ok(unload_ok)
    }
}
