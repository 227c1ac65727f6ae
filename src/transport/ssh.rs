use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::device::Device;
use crate::error::{BenchError, Result};
use crate::transport::{Transport, TransportFactory};

/// Blocking SSH/SCP transport shelling out to the system `ssh` and `scp`
/// binaries. Stateless; every call opens a fresh connection.
#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    user: String,
    port: u16,
    key_path: PathBuf,
}

impl SshTransport {
    pub fn new(host: String, user: String, port: u16, key_path: PathBuf) -> Self {
        Self {
            host,
            user,
            port,
            key_path,
        }
    }

    fn base_ssh_args(&self) -> Vec<String> {
        vec![
            "-i".into(),
            self.key_path.display().to_string(),
            "-p".into(),
            self.port.to_string(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
        ]
    }

    fn base_scp_args(&self) -> Vec<String> {
        vec![
            // Force the legacy scp protocol; lab devices ship an old sshd
            // without sftp support.
            "-O".into(),
            "-i".into(),
            self.key_path.display().to_string(),
            "-P".into(),
            self.port.to_string(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
        ]
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn run_checked(program: &str, args: &[String]) -> Result<()> {
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(BenchError::Transport {
                command: format!("{} {}", program, args.join(" ")),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

impl Transport for SshTransport {
    fn run(&self, command: &str) -> Result<()> {
        // sh -lc allows chained commands on the remote side.
        let mut args = self.base_ssh_args();
        args.push(self.target());
        args.push("sh".into());
        args.push("-lc".into());
        args.push(command.to_string());
        Self::run_checked("ssh", &args)
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let mut args = self.base_scp_args();
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.target(), remote));
        Self::run_checked("scp", &args)
    }

    fn download(&self, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut args = self.base_scp_args();
        args.push(format!("{}:{}", self.target(), remote));
        args.push(local.display().to_string());
        Self::run_checked("scp", &args)
    }
}

/// Default factory: one [`SshTransport`] per device, key resolved from the
/// configured access directory.
pub struct SshTransportFactory {
    access_dir: PathBuf,
}

impl SshTransportFactory {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            access_dir: config.access_dir.clone(),
        }
    }
}

impl TransportFactory for SshTransportFactory {
    fn connect(&self, device: &Device) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(SshTransport::new(
            device.host.clone(),
            device.user.clone(),
            device.port,
            self.access_dir.join(&device.key_name),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_args_include_key_and_port() {
        let t = SshTransport::new(
            "10.0.0.7".into(),
            "root".into(),
            2222,
            PathBuf::from("/data/access/k1"),
        );
        let args = t.base_ssh_args();
        assert!(args.contains(&"/data/access/k1".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn scp_args_force_legacy_protocol() {
        let t = SshTransport::new("h".into(), "root".into(), 22, PathBuf::from("/k"));
        assert_eq!(t.base_scp_args()[0], "-O");
    }

    #[test]
    fn run_surfaces_nonzero_exit_as_transport_error() {
        let err = SshTransport::run_checked("false", &[]).unwrap_err();
        assert!(matches!(err, BenchError::Transport { .. }));
    }
}
