//! Device metadata derived from a NUT status mapping.
//!
//! Each helper walks a fixed list of variable names and returns the first one
//! the UPS driver reported. Drivers disagree on which names they populate, so
//! the order matters.

use std::collections::BTreeMap;

/// Flat mapping of NUT variable name to value, as returned by `LIST VAR`.
pub type Status = BTreeMap<String, String>;

const MANUFACTURER_KEYS: &[&str] = &[
    "device.mfr",
    "ups.mfr",
    "ups.vendorid",
    "driver.version.data",
];
const MODEL_KEYS: &[&str] = &["device.model", "ups.model", "ups.productid"];
const FIRMWARE_KEYS: &[&str] = &["ups.firmware", "ups.firmware.aux"];
const SERIAL_KEYS: &[&str] = &["device.serial", "ups.serial"];

fn first_of<'a>(status: &'a Status, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| status.get(*key))
        .map(String::as_str)
        .find(|value| !value.is_empty())
}

/// Find the best manufacturer value from the status.
pub fn manufacturer(status: &Status) -> Option<&str> {
    first_of(status, MANUFACTURER_KEYS)
}

/// Find the best model value from the status.
pub fn model(status: &Status) -> Option<&str> {
    first_of(status, MODEL_KEYS)
}

/// Find the best firmware value from the status.
pub fn firmware(status: &Status) -> Option<&str> {
    first_of(status, FIRMWARE_KEYS)
}

/// Find the best serial value from the status.
///
/// Some drivers report placeholder serials ("unknown", "000000"); those are
/// treated as if no serial was reported at all.
pub fn serial(status: &Status) -> Option<&str> {
    let serial = first_of(status, SERIAL_KEYS)?;
    if serial.eq_ignore_ascii_case("unknown") || serial.chars().all(|c| c == '0') {
        return None;
    }
    Some(serial)
}

/// Build a stable identifier for the UPS.
///
/// Without a serial the remaining fields are not unique across units, so
/// `None` is returned and callers fall back to the config entry id.
pub fn unique_id(status: &Status) -> Option<String> {
    let serial = serial(status)?;

    let parts: Vec<&str> = [manufacturer(status), model(status), Some(serial)]
        .into_iter()
        .flatten()
        .collect();

    Some(parts.join("_"))
}
