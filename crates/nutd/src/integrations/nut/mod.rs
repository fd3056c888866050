//! Network UPS Tools integration

pub mod client;
pub mod config;
mod data;
// Private module - allowed by clippy.toml allow-private-module-inception
#[allow(clippy::module_inception)]
mod nut;
mod sensor;
pub mod status;

pub use data::NutData;
use linkme::distributed_slice;
pub use nut::NutIntegration;
pub use nut::NutRuntimeData;

use crate::engine;

/// Config entry domain served by this integration
pub const DOMAIN: &str = "nut";

#[distributed_slice(engine::INTEGRATION_REGISTRY)]
fn init_nut(ctx: &engine::IntegrationContext) -> engine::IntegrationFactoryResult {
    if !ctx.config.has_domain(DOMAIN) {
        return Ok(None);
    }

    Ok(Some(Box::new(NutIntegration::new(
        client::TcpClientFactory,
        engine::EntryStore::new(),
    ))))
}
