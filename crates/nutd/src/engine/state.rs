use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Serialize;

use super::device::Device;

/// State of a UPS status entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct UpsState {
    /// Whether the last poll produced data
    pub available: bool,

    /// Variables reported by the UPS on the last successful poll
    pub status: BTreeMap<String, String>,
}

impl UpsState {
    /// The `ups.status` flags, e.g. "OL CHRG"
    pub fn ups_status(&self) -> Option<&str> {
        self.status.get("ups.status").map(String::as_str)
    }
}

/// Centralized snapshot of the entire engine state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct State {
    pub ups: HashMap<String, UpsState>,
    pub devices: HashMap<String, Device>,
}
