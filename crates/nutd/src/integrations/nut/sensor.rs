//! Sensor platform: one status entity per UPS, following the coordinator.

use tracing::debug;
use tracing::info;

use super::DOMAIN;
use super::status::Status;
use crate::engine::Coordinator;
use crate::engine::Device;
use crate::engine::FromIntegrationMessage;
use crate::engine::FromIntegrationSender;
use crate::engine::PlatformHandle;
use crate::engine::SetupError;

pub const PLATFORM: &str = "sensor";

/// Identity of the UPS the sensor reports on
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub unique_id: String,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
}

/// Turn a display name into the object id part of an entity id
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "ups".to_string()
    } else {
        slug.to_string()
    }
}

/// Entity id of an entry's status sensor
///
/// Keyed on the config entry id: UPS aliases are commonly just "ups" and
/// repeat across servers.
pub fn status_entity_id(entry_id: &str) -> String {
    format!("{}.{}_status", PLATFORM, slugify(entry_id))
}

async fn send(
    to_engine: &FromIntegrationSender,
    msg: FromIntegrationMessage,
) -> Result<(), SetupError> {
    to_engine.send(msg).await.map_err(|_| SetupError::EngineClosed)
}

/// Register the device and its status entity, then forward every coordinator
/// update to the engine until the platform is unloaded
pub async fn setup_entry(
    entry_id: &str,
    info: &DeviceInfo,
    coordinator: &Coordinator<Status>,
    to_engine: FromIntegrationSender,
) -> Result<PlatformHandle, SetupError> {
    let entity_id = status_entity_id(entry_id);

    let mut device = Device::new(info.unique_id.clone(), info.name.clone());
    device.identifiers.push((DOMAIN.to_string(), info.unique_id.clone()));
    device.manufacturer = info.manufacturer.clone();
    device.model = info.model.clone();
    device.sw_version = info.firmware.clone();

    send(&to_engine, FromIntegrationMessage::DeviceRegistered { device }).await?;
    send(
        &to_engine,
        FromIntegrationMessage::EntityDiscovered {
            entity_id: entity_id.clone(),
            integration_name: DOMAIN.to_string(),
            device_id: Some(info.unique_id.clone()),
        },
    )
    .await?;

    // Subscribe before publishing the current value so no update slips between
    let mut rx = coordinator.subscribe();
    let current = rx.borrow_and_update().data.clone();
    send(
        &to_engine,
        FromIntegrationMessage::UpsStatusChanged {
            entity_id: entity_id.clone(),
            status: current,
        },
    )
    .await?;

    let task_entity_id = entity_id.clone();
    let task_tx = to_engine;
    let task = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().data.clone();
            let msg = FromIntegrationMessage::UpsStatusChanged {
                entity_id: task_entity_id.clone(),
                status,
            };
            if task_tx.send(msg).await.is_err() {
                debug!("Engine gone, stopping updates for {}", task_entity_id);
                break;
            }
        }
    });

    info!("Set up {} entity {}", PLATFORM, entity_id);
    Ok(PlatformHandle::new(PLATFORM, vec![entity_id], task))
}
