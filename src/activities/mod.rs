mod buildfs;
mod checkout;
mod fetch;
mod prebuild;
mod workspace;

pub use buildfs::BuildFsArgs;
pub use checkout::{CheckoutAndInspectArgs, ImageConfig, ProjectConfig, ProjectTask};
pub use fetch::FetchRepositoryArgs;
pub use prebuild::{PrebuildArgs, TaskOutcome};
pub use workspace::{StartWorkspaceArgs, StartWorkspaceResult, StopWorkspaceArgs};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::AgentConfig;
use crate::db::Db;
use crate::net::IpBlockAllocator;
use crate::vm::VmRuntime;

/// Guest filesystem contract. The project drive is mounted at `DEV_DIR`
/// with the repository checkout under it; prebuild and workspace task
/// scripts and logs live in per-purpose subdirectories.
pub const DEV_DIR: &str = "/home/hocus/dev";
pub const PROJECT_DIR: &str = "/home/hocus/dev/project";
pub const PREBUILD_SCRIPTS_DIR: &str = "/home/hocus/dev/.hocus/init";
pub const WORKSPACE_SCRIPTS_DIR: &str = "/home/hocus/dev/.hocus/command";
pub const AUTHORIZED_KEYS_PATH: &str = "/home/hocus/.ssh/authorized_keys";
/// Mount point used by the disposable buildfs and checkout VMs.
pub const WORKDIR: &str = "/tmp/workdir";
pub const WORKDIR_PROJECT: &str = "/tmp/workdir/project";

/// The gateway that publishes running workspaces to the outside world.
/// External collaborator with a deliberately narrow surface.
pub trait SshGateway: Send + Sync {
    fn add_public_keys_to_authorized_keys<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<()>>;
}

/// Talks to the gateway daemon over its unix socket with one
/// newline-delimited JSON request per call.
pub struct UnixSocketGateway {
    socket_path: PathBuf,
}

impl UnixSocketGateway {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }
}

impl SshGateway for UnixSocketGateway {
    fn add_public_keys_to_authorized_keys<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut stream = tokio::net::UnixStream::connect(&self.socket_path)
                .await
                .with_context(|| {
                    format!(
                        "could not reach ssh gateway at {}",
                        self.socket_path.display()
                    )
                })?;
            let request = serde_json::json!({ "addPublicKeysToAuthorizedKeys": keys });
            let mut payload = serde_json::to_vec(&request)?;
            payload.push(b'\n');
            stream
                .write_all(&payload)
                .await
                .context("could not send keys to ssh gateway")?;
            stream.shutdown().await.ok();

            let mut response = String::new();
            BufReader::new(stream)
                .read_line(&mut response)
                .await
                .context("could not read ssh gateway response")?;
            let ack: serde_json::Value = serde_json::from_str(response.trim())
                .context("ssh gateway answered with invalid json")?;
            if ack.get("ok").and_then(|value| value.as_bool()) != Some(true) {
                bail!("ssh gateway rejected the keys: {}", response.trim());
            }
            Ok(())
        }
        .boxed()
    }
}

/// The activity registry: a plain struct of constructed collaborators.
/// The external workflow engine calls one activity method at a time with
/// an argument record and gets a result record back; records carry only
/// host paths, primitives and byte strings so they survive restarts.
pub struct Agent {
    pub(crate) config: Arc<AgentConfig>,
    pub(crate) db: Db,
    pub(crate) vm: VmRuntime,
    pub(crate) gateway: Arc<dyn SshGateway>,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let config = Arc::new(config);
        let db = Db::connect(&config.database_url).await?;
        let allocator = Arc::new(IpBlockAllocator::load(config.busy_ip_file.clone()).await?);
        let gateway: Arc<dyn SshGateway> =
            Arc::new(UnixSocketGateway::new(config.gateway_socket.clone()));
        Ok(Self::assemble(config, db, allocator, gateway))
    }

    /// Wires an agent from already constructed collaborators.
    pub fn assemble(
        config: Arc<AgentConfig>,
        db: Db,
        allocator: Arc<IpBlockAllocator>,
        gateway: Arc<dyn SshGateway>,
    ) -> Self {
        let vm = VmRuntime::new(config.clone(), allocator);
        Self {
            config,
            db,
            vm,
            gateway,
        }
    }

    pub fn vm_runtime(&self) -> &VmRuntime {
        &self.vm
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn generate_instance_id(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::new_v4())
    }
}

/// Wraps a task command into the script the guest actually runs. The
/// flags make failures of any pipeline stage fatal so a task cannot
/// half-succeed silently.
pub(crate) fn task_wrapper_script(command: &str) -> String {
    format!(
        "#!/bin/bash\n\
         set -o pipefail -o errexit\n\
         export DEBIAN_FRONTEND=noninteractive\n\
         \n\
         {command}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_script_keeps_the_command_and_the_strict_flags() {
        let script = task_wrapper_script("npm install && npm run build");
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("set -o pipefail -o errexit"));
        assert!(script.ends_with("npm install && npm run build\n"));
    }

    #[test]
    fn guest_layout_hangs_off_the_dev_mount() {
        assert!(PROJECT_DIR.starts_with(DEV_DIR));
        assert!(PREBUILD_SCRIPTS_DIR.starts_with(DEV_DIR));
        assert!(WORKSPACE_SCRIPTS_DIR.starts_with(DEV_DIR));
    }
}
