use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    22
}

/// Static identity of a controllable remote device.
///
/// This is connection metadata only, never runtime state. Runtime
/// exclusivity is enforced separately by the [`JobManager`] through
/// per-device locks.
///
/// [`JobManager`]: crate::job::JobManager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Logical device identifier used by callers.
    pub id: String,
    /// Network address of the device.
    pub host: String,
    /// SSH login user (typically `root` on lab hardware).
    pub user: String,
    /// Filename of the SSH private key, resolved relative to the access dir.
    pub key_name: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
}
