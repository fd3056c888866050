//! Messages from integrations to the engine

use std::collections::BTreeMap;

use super::device::Device;

/// Messages FROM integrations TO the engine (events/state updates)
#[derive(Debug, Clone)]
pub enum FromIntegrationMessage {
    /// A device was registered or its metadata changed
    DeviceRegistered { device: Device },

    /// An entity was discovered and registered
    EntityDiscovered {
        entity_id: String,
        integration_name: String,
        device_id: Option<String>,
    },

    /// An entity was removed (entry unloaded, etc.)
    EntityRemoved { entity_id: String },

    /// A UPS status entity has new data; `None` means it is unavailable
    UpsStatusChanged {
        entity_id: String,
        status: Option<BTreeMap<String, String>>,
    },
}
