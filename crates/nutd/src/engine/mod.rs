mod coordinator;
mod device;
// Private module - allowed by clippy.toml allow-private-module-inception
#[allow(clippy::module_inception)]
mod engine;
mod entries;
mod integration;
mod message;
mod platform;
pub mod state;
mod store;

pub use coordinator::Coordinator;
pub use coordinator::Snapshot;
pub use coordinator::UpdateFailed;
pub use coordinator::UpdateMethod;
pub use device::Device;
pub use engine::Engine;
pub use engine::EngineError;
pub use engine::StateReader;
pub use entries::ConfigEntries;
pub use entries::ConfigEntriesError;
pub use entries::ConfigEntry;
pub use entries::ListenerHandle;
pub use integration::FromIntegrationSender;
pub use integration::Host;
pub use integration::Integration;
pub use integration::IntegrationContext;
pub use integration::IntegrationFactoryResult;
pub use integration::REGISTRY as INTEGRATION_REGISTRY;
pub use integration::SetupError;
pub use integration::UnloadError;
pub use message::FromIntegrationMessage;
pub use platform::PlatformHandle;
pub use state::State;
pub use state::UpsState;
pub use store::EntryStore;
