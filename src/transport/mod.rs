pub mod ssh;

use std::path::Path;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;

pub use ssh::SshTransport;

/// Blocking remote-shell/file-transfer capability against one fixed device.
///
/// Implementations are stateless and may be called from several tasks; the
/// orchestrator always invokes them via `spawn_blocking` so the async
/// coordination flow never stalls on device I/O.
pub trait Transport: Send + Sync {
    /// Run a remote shell command. Non-zero exit is a transport error.
    fn run(&self, command: &str) -> Result<()>;

    /// Upload a local file to a remote path.
    fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Download a remote file to a local path, creating parent directories.
    fn download(&self, remote: &str, local: &Path) -> Result<()>;
}

/// Produces a transport bound to one device. The manager uses the
/// SSH-backed factory in production; tests inject scripted transports.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, device: &Device) -> Result<Arc<dyn Transport>>;
}
