pub mod api;
pub mod image;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::config::AgentConfig;
use crate::error::{combine_errors, join_errors, AgentError};
use crate::net::{self, IpBlockAllocator, VmNetwork};
use crate::ssh::{self, ExecOpts, SshAuth, SshConfig, SshSession};
use api::{BootSource, Drive, MachineConfig, NetworkInterface, VmmApi};

/// An extra block device attached to a VM, optionally mounted inside the
/// guest once ssh is up.
#[derive(Debug, Clone)]
pub struct ExtraDrive {
    pub path: PathBuf,
    pub mount_path: Option<String>,
    pub read_only: bool,
}

/// Everything needed to boot one VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub instance_id: String,
    /// Root filesystem for this boot. Callers pass per-project images
    /// because credentials are baked into them.
    pub root_fs_path: PathBuf,
    pub extra_drives: Vec<ExtraDrive>,
    /// When false and the body succeeds, the VM is left running and the
    /// caller takes over ownership; it must stop the workspace later.
    pub should_poweroff: bool,
    pub ssh_user: String,
    pub ssh_auth: SshAuth,
}

#[derive(Debug, Clone)]
pub struct DriveMount {
    pub device: String,
    pub mount_path: String,
}

/// In-memory handle to a running VM, alive for one `with_vm` scope.
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub instance_id: String,
    pub pid: i32,
    pub network: VmNetwork,
    pub ip_block_id: u16,
    pub extra_drive_mounts: Vec<DriveMount>,
}

pub fn uds_path(instance_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{instance_id}.sock"))
}

pub fn scratch_dir(instance_id: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{instance_id}"))
}

fn pidfile_path(instance_id: &str) -> PathBuf {
    scratch_dir(instance_id).join("vmm.pid")
}

fn guest_device_name(extra_drive_index: usize) -> String {
    //the root drive is vda, extra drives follow in attach order
    format!("/dev/vd{}", (b'b' + extra_drive_index as u8) as char)
}

fn validate_instance_id(instance_id: &str) -> Result<()> {
    let well_formed = !instance_id.is_empty()
        && instance_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if !well_formed {
        return Err(AgentError::ValidationFailed(format!(
            "instance id {instance_id:?} must be non-empty and contain only alphanumerics, '-', '_' or '.'"
        ))
        .into());
    }
    Ok(())
}

/// Owns the host resources behind running VMs: the VMM processes, tap
/// devices, control sockets and the IP-block pool. All acquisition goes
/// through [`with_vm`](VmRuntime::with_vm) so nothing can leak on an
/// early return.
pub struct VmRuntime {
    config: Arc<AgentConfig>,
    allocator: Arc<IpBlockAllocator>,
    children: tokio::sync::Mutex<HashMap<String, tokio::process::Child>>,
}

impl VmRuntime {
    pub fn new(config: Arc<AgentConfig>, allocator: Arc<IpBlockAllocator>) -> Self {
        Self {
            config,
            allocator,
            children: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn allocator(&self) -> &IpBlockAllocator {
        &self.allocator
    }

    /// Boots a VM and waits until ssh inside it answers.
    #[tracing::instrument(skip(self, spec), fields(instance_id = %spec.instance_id))]
    pub async fn start_vm(&self, spec: &VmSpec) -> Result<(VmHandle, SshSession)> {
        validate_instance_id(&spec.instance_id)?;
        let block_id = self.allocator.allocate().await?;
        let network = net::network_for_block(block_id);

        if let Err(err) = net::create_tap_device(&network).await {
            let err = match self.allocator.release(block_id).await {
                Ok(()) => err,
                Err(release_err) => join_errors(err, release_err),
            };
            return Err(err.context("could not bring up vm network"));
        }

        match self.boot(spec, &network).await {
            Ok(pair) => Ok(pair),
            Err(err) => {
                //boot failed partway, sweep up whatever exists
                let handle = VmHandle {
                    instance_id: spec.instance_id.clone(),
                    pid: self.recorded_pid(&spec.instance_id).await.unwrap_or(0),
                    network,
                    ip_block_id: block_id,
                    extra_drive_mounts: Vec::new(),
                };
                match self.shutdown_and_release(&handle).await {
                    Ok(()) => Err(err),
                    Err(teardown_err) => Err(join_errors(err, teardown_err)),
                }
            }
        }
    }

    async fn boot(&self, spec: &VmSpec, network: &VmNetwork) -> Result<(VmHandle, SshSession)> {
        let scratch = scratch_dir(&spec.instance_id);
        tokio::fs::create_dir_all(&scratch)
            .await
            .with_context(|| format!("could not create scratch dir {}", scratch.display()))?;

        let socket = uds_path(&spec.instance_id);
        match tokio::fs::remove_file(&socket).await {
            Ok(()) => tracing::warn!(socket = %socket.display(), "removed stale vmm socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("could not remove stale socket {}", socket.display()))
            }
        }

        //vm console output lands next to the instance's other scratch files
        let stdout_file = std::fs::File::create(scratch.join("vm.out"))
            .context("could not create vm.out")?;
        let stderr_file = std::fs::File::create(scratch.join("vm.err"))
            .context("could not create vm.err")?;

        let child = Command::new(&self.config.firecracker_path)
            .arg("--api-sock")
            .arg(&socket)
            .arg("--id")
            .arg(&spec.instance_id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .context("failed to spawn firecracker process")?;
        let pid = child.id().context("firecracker child has no pid")? as i32;
        //recorded so a later stop from another process can find the vmm
        tokio::fs::write(pidfile_path(&spec.instance_id), pid.to_string())
            .await
            .context("could not record vmm pid")?;
        self.children
            .lock()
            .await
            .insert(spec.instance_id.clone(), child);

        let api = VmmApi::new(&socket);
        api.wait_ready(Duration::from_secs(5)).await?;

        api.put_machine_config(&MachineConfig {
            vcpu_count: self.config.vcpu_count,
            mem_size_mib: self.config.mem_size_mib,
            smt: false,
        })
        .await?;

        let boot_args = format!(
            "{} ip={}::{}:255.255.255.252::eth0:off",
            self.config.kernel_boot_args, network.vm_ip, network.tap_ip
        );
        api.put_boot_source(&BootSource {
            kernel_image_path: self.config.kernel_path.display().to_string(),
            boot_args,
        })
        .await?;

        api.put_drive(&Drive {
            drive_id: "rootfs".to_owned(),
            path_on_host: spec.root_fs_path.display().to_string(),
            is_root_device: true,
            is_read_only: false,
        })
        .await?;

        let mut mounts = Vec::new();
        for (index, extra) in spec.extra_drives.iter().enumerate() {
            api.put_drive(&Drive {
                drive_id: format!("extra{index}"),
                path_on_host: extra.path.display().to_string(),
                is_root_device: false,
                is_read_only: extra.read_only,
            })
            .await?;
            if let Some(mount_path) = &extra.mount_path {
                mounts.push(DriveMount {
                    device: guest_device_name(index),
                    mount_path: mount_path.clone(),
                });
            }
        }

        api.put_network_interface(&NetworkInterface {
            iface_id: "eth0".to_owned(),
            host_dev_name: network.tap_name.clone(),
        })
        .await?;

        api.start_instance()
            .await
            .context("vmm refused to start the instance")?;
        tracing::info!(vm_ip = %network.vm_ip, "vm started, waiting for ssh");

        let ssh_config = SshConfig {
            host: network.vm_ip,
            port: 22,
            user: spec.ssh_user.clone(),
            auth: spec.ssh_auth.clone(),
        };
        let session = match ssh::wait_for_ssh(&ssh_config, self.config.boot_timeout).await {
            Ok(session) => session,
            Err(_) => {
                return Err(AgentError::VmBootTimeout {
                    instance_id: spec.instance_id.clone(),
                    waited: self.config.boot_timeout,
                }
                .into())
            }
        };

        for mount in &mounts {
            session
                .exec(
                    &["sudo", "mkdir", "-p", &mount.mount_path],
                    ExecOpts::default(),
                )
                .await
                .with_context(|| format!("could not create mount point {}", mount.mount_path))?;
            session
                .exec(
                    &["sudo", "mount", &mount.device, &mount.mount_path],
                    ExecOpts::default(),
                )
                .await
                .with_context(|| {
                    format!("could not mount {} at {}", mount.device, mount.mount_path)
                })?;
        }

        let handle = VmHandle {
            instance_id: spec.instance_id.clone(),
            pid,
            network: network.clone(),
            ip_block_id: network.block_id,
            extra_drive_mounts: mounts,
        };
        Ok((handle, session))
    }

    /// Tears a VM down and releases every host resource it held. A failed
    /// step never stops the later ones; their failures come back joined.
    #[tracing::instrument(skip(self, handle), fields(instance_id = %handle.instance_id))]
    pub async fn shutdown_and_release(&self, handle: &VmHandle) -> Result<()> {
        let mut failures: Vec<anyhow::Error> = Vec::new();
        let socket = uds_path(&handle.instance_id);

        let api = VmmApi::new(&socket);
        if let Err(err) = api.send_ctrl_alt_del().await {
            tracing::warn!(error = %format!("{err:#}"), "graceful shutdown request failed, will kill");
        }

        let child = self.children.lock().await.remove(&handle.instance_id);
        match child {
            Some(mut child) => {
                match tokio::time::timeout(self.config.graceful_shutdown_timeout, child.wait())
                    .await
                {
                    Ok(Ok(status)) => tracing::debug!(?status, "vmm exited"),
                    Ok(Err(err)) => tracing::warn!(error = %err, "could not wait for vmm"),
                    Err(_) => {
                        tracing::warn!("vmm did not power off in time, killing it");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            }
            None if handle.pid > 1 => {
                //vmm belongs to an earlier agent process, fall back to signals
                let deadline =
                    tokio::time::Instant::now() + self.config.graceful_shutdown_timeout;
                loop {
                    let alive = unsafe { libc::kill(handle.pid, 0) } == 0;
                    if !alive {
                        break;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        tracing::warn!(pid = handle.pid, "vmm did not power off in time, killing it");
                        unsafe {
                            libc::kill(handle.pid, libc::SIGKILL);
                        }
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
            None => tracing::warn!("no vmm pid recorded, skipping process shutdown"),
        }

        if let Err(err) = net::delete_tap_device(&handle.network).await {
            failures.push(err.context("could not delete tap device"));
        }
        if let Err(err) = remove_file_if_exists(&socket).await {
            failures.push(err);
        }
        if let Err(err) = remove_dir_if_exists(&scratch_dir(&handle.instance_id)).await {
            failures.push(err);
        }
        if let Err(err) = self.allocator.release(handle.ip_block_id).await {
            failures.push(err.context("could not release ip block"));
        }

        match combine_errors(failures) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Scoped VM acquisition. Boots a VM, hands the body an ssh session
    /// plus the handle, and tears everything down on every exit path,
    /// unless the caller opted out of poweroff and the body succeeded, in
    /// which case ownership of the running VM moves to the caller.
    pub async fn with_vm<T, F, Fut>(&self, spec: VmSpec, body: F) -> Result<T>
    where
        F: FnOnce(SshSession, VmHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let should_poweroff = spec.should_poweroff;
        let (handle, session) = self.start_vm(&spec).await?;
        let result = body(session, handle.clone()).await;

        if !should_poweroff && result.is_ok() {
            tracing::info!(instance_id = %handle.instance_id, "leaving vm running, caller owns it now");
            return result;
        }

        let teardown = self.shutdown_and_release(&handle).await;
        match (result, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(teardown_err)) => Err(teardown_err),
            (Err(body_err), Ok(())) => Err(body_err),
            (Err(body_err), Err(teardown_err)) => Err(join_errors(body_err, teardown_err)),
        }
    }

    /// Opens the guest's network to the outside world.
    pub async fn make_network_public(&self, handle: &VmHandle) -> Result<()> {
        net::expose_to_network(&handle.network).await
    }

    /// Pid recorded at boot time, readable across agent restarts.
    pub async fn recorded_pid(&self, instance_id: &str) -> Option<i32> {
        let raw = tokio::fs::read_to_string(pidfile_path(instance_id))
            .await
            .ok()?;
        raw.trim().parse().ok()
    }
}

async fn remove_file_if_exists(path: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("could not remove {}", path.display())),
    }
}

async fn remove_dir_if_exists(path: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("could not remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_are_checked_before_they_reach_the_filesystem() {
        assert!(validate_instance_id("fc-1234").is_ok());
        assert!(validate_instance_id("hocus_ws.7").is_ok());
        assert!(validate_instance_id("").is_err());
        assert!(validate_instance_id("../escape").is_err());
        assert!(validate_instance_id("a b").is_err());
    }

    #[test]
    fn invalid_instance_id_is_a_validation_failure() {
        let err = validate_instance_id("no/slashes").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::ValidationFailed(_))
        ));
    }

    #[test]
    fn extra_drives_follow_the_root_device() {
        assert_eq!(guest_device_name(0), "/dev/vdb");
        assert_eq!(guest_device_name(1), "/dev/vdc");
        assert_eq!(guest_device_name(2), "/dev/vdd");
    }

    #[test]
    fn per_instance_paths_are_stable() {
        assert_eq!(uds_path("fc-1").to_str().unwrap(), "/tmp/fc-1.sock");
        assert_eq!(scratch_dir("fc-1").to_str().unwrap(), "/tmp/fc-1");
        assert_eq!(
            pidfile_path("fc-1").to_str().unwrap(),
            "/tmp/fc-1/vmm.pid"
        );
    }
}
