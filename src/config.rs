use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use dotenvy::dotenv;

use crate::ssh::SshAuth;

/// Agent-wide configuration. Built once from the environment and passed
/// explicitly to the collaborators that need it.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Path to the firecracker binary on the host.
    pub firecracker_path: PathBuf,
    /// Kernel image booted into every VM.
    pub kernel_path: PathBuf,
    /// Base kernel command line; the per-VM ip= clause is appended to it.
    pub kernel_boot_args: String,
    /// Persistence file for the busy IP-block set.
    pub busy_ip_file: PathBuf,
    /// Database the prebuild events, tasks and log chunks live in.
    pub database_url: String,
    /// Unix socket of the SSH gateway collaborator.
    pub gateway_socket: PathBuf,
    pub ssh_user: String,
    /// Password accepted by freshly built root filesystems, used by the
    /// initial-boot activities before any key is installed.
    pub ssh_boot_password: String,
    /// Private key used for prebuild and workspace sessions.
    pub ssh_key_path: PathBuf,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    /// How long to wait for sshd inside a booting VM before giving up.
    pub boot_timeout: Duration,
    /// How long a VM gets to power off cleanly before it is killed.
    pub graceful_shutdown_timeout: Duration,
}

fn var_or(name: &str, default: &str) -> String {
    dotenvy::var(name).unwrap_or_else(|_| {
        tracing::warn!("No {name} provided, defaulting to {default}");
        default.to_owned()
    })
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        //load dotenv file if it exists
        match dotenv() {
            Err(_) => tracing::info!("No .env file found, nothing to load"),
            Ok(_) => tracing::info!("Loaded config from .env file"),
        }

        let vcpu_count = var_or("VM_VCPU_COUNT", "1").parse().unwrap_or(1);
        let mem_size_mib = var_or("VM_MEM_SIZE_MIB", "1024").parse().unwrap_or(1024);
        let boot_timeout_secs: u64 = var_or("VM_BOOT_TIMEOUT_SECS", "60").parse().unwrap_or(60);
        let shutdown_secs: u64 = var_or("VM_SHUTDOWN_TIMEOUT_SECS", "10").parse().unwrap_or(10);

        let config = Self {
            firecracker_path: var_or("FIRECRACKER_PATH", "firecracker").into(),
            kernel_path: var_or("KERNEL_PATH", "./resources/vmlinux").into(),
            kernel_boot_args: var_or(
                "KERNEL_BOOT_ARGS",
                "console=ttyS0 reboot=k panic=1 pci=off",
            ),
            busy_ip_file: var_or("BUSY_IP_FILE", "./busy-ip-blocks.json").into(),
            database_url: var_or("DATABASE_URL", "sqlite://hocus-agent.db"),
            gateway_socket: var_or("SSH_GATEWAY_SOCKET", "/run/hocus/ssh-gateway.sock").into(),
            ssh_user: var_or("VM_SSH_USER", "hocus"),
            ssh_boot_password: var_or("VM_SSH_BOOT_PASSWORD", "hocus"),
            ssh_key_path: var_or("VM_SSH_KEY_PATH", "./resources/workspace-key").into(),
            vcpu_count,
            mem_size_mib,
            boot_timeout: Duration::from_secs(boot_timeout_secs),
            graceful_shutdown_timeout: Duration::from_secs(shutdown_secs),
        };

        tracing::info!("Loaded config from environment");
        Ok(config)
    }

    /// Auth used before a VM has any installed keys.
    pub fn boot_auth(&self) -> SshAuth {
        SshAuth::Password(self.ssh_boot_password.clone())
    }

    /// Auth used for prebuild and workspace sessions.
    pub fn workspace_auth(&self) -> SshAuth {
        SshAuth::KeyFile(self.ssh_key_path.clone())
    }
}
