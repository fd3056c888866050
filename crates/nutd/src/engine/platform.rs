use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::integration::FromIntegrationSender;
use super::message::FromIntegrationMessage;

/// A running entity platform of one config entry
///
/// Holds the task that feeds entity state to the engine and the ids of the
/// entities it created, so they can be withdrawn on unload.
pub struct PlatformHandle {
    platform: &'static str,
    entity_ids: Vec<String>,
    task: JoinHandle<()>,
}

impl PlatformHandle {
    pub fn new(platform: &'static str, entity_ids: Vec<String>, task: JoinHandle<()>) -> Self {
        Self {
            platform,
            entity_ids,
            task,
        }
    }

    pub fn platform(&self) -> &'static str {
        self.platform
    }

    /// Entities still registered with the engine
    pub fn entity_ids(&self) -> &[String] {
        &self.entity_ids
    }

    /// Stop the platform and remove its entities from the engine
    ///
    /// Returns false if the engine could not be told about every removal. The
    /// entities that were not withdrawn stay on the handle so a later unload
    /// can retry them.
    pub async fn unload(&mut self, to_engine: &FromIntegrationSender) -> bool {
        self.task.abort();

        let mut remaining = Vec::new();
        for entity_id in std::mem::take(&mut self.entity_ids) {
            let msg = FromIntegrationMessage::EntityRemoved {
                entity_id: entity_id.clone(),
            };
            if let Err(e) = to_engine.send(msg).await {
                warn!("Failed to send EntityRemoved for {}: {}", entity_id, e);
                remaining.push(entity_id);
            }
        }
        self.entity_ids = remaining;

        let ok = self.entity_ids.is_empty();
        debug!("Unloaded platform {} (ok={})", self.platform, ok);
        ok
    }
}

impl std::fmt::Debug for PlatformHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformHandle")
            .field("platform", &self.platform)
            .field("entity_ids", &self.entity_ids)
            .finish()
    }
}
