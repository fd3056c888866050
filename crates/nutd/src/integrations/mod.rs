#[cfg(feature = "integration_nut")]
pub mod nut;
