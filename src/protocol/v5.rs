//! MQTT v5.0 additions to the 3.1.1 wire format: properties and reason codes

pub mod properties;
pub mod reason_codes;
