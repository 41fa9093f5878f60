//! Cache key identifying one device within one site.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `(site, device)` pair used to key the latest-value cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    /// Site identifier.
    pub site_id: String,
    /// Device identifier within the site (coordinator or node id).
    pub device_id: String,
}

impl DeviceKey {
    /// Creates a key from a site id and a device id.
    #[must_use]
    pub fn new(site_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site_id, self.device_id)
    }
}
