use serde::{Deserialize, Serialize};

/// Identifier the mux daemon assigns to a device for the duration of its
/// attachment. A re-attached device may receive a different id.
pub type DeviceId = u32;

/// Descriptive properties of an attached device, as reported by the mux
/// daemon's attach frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub serial: String,
    #[serde(default)]
    pub product_id: Option<u32>,
    #[serde(default)]
    pub location: Option<u32>,
}
