use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::prebuild::upload_task_scripts;
use super::{Agent, AUTHORIZED_KEYS_PATH, DEV_DIR, PROJECT_DIR, WORKSPACE_SCRIPTS_DIR};
use crate::error::AgentError;
use crate::net::network_for_block;
use crate::ssh::{shell_quote, ExecOpts};
use crate::vm::{ExtraDrive, VmHandle, VmSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkspaceArgs {
    pub root_fs_path: PathBuf,
    pub project_drive_path: PathBuf,
    /// Commands started in the background inside the workspace.
    pub tasks: Vec<String>,
    /// Public keys of everyone allowed to ssh into the workspace.
    pub authorized_keys: Vec<String>,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkspaceResult {
    pub instance_id: String,
    pub vmm_pid: i32,
    pub vm_ip: String,
    pub ip_block_id: u16,
    /// Shell pids of the launched background tasks, in task order.
    pub task_pids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopWorkspaceArgs {
    pub instance_id: String,
    pub ip_block_id: u16,
}

impl Agent {
    /// Boots a long-lived workspace VM: tasks go to the background,
    /// authorized keys are installed, the network flips to public and the
    /// keys are registered with the ssh gateway. Teardown is deferred to
    /// a later [`stop_workspace`](Agent::stop_workspace).
    #[tracing::instrument(skip(self, args), fields(task_count = args.tasks.len()))]
    pub async fn start_workspace(&self, args: StartWorkspaceArgs) -> Result<StartWorkspaceResult> {
        let spec = VmSpec {
            instance_id: args
                .instance_id
                .clone()
                .unwrap_or_else(|| Self::generate_instance_id("workspace")),
            root_fs_path: args.root_fs_path.clone(),
            extra_drives: vec![ExtraDrive {
                path: args.project_drive_path.clone(),
                mount_path: Some(DEV_DIR.to_owned()),
                read_only: false,
            }],
            should_poweroff: false,
            ssh_user: self.config.ssh_user.clone(),
            ssh_auth: self.config.workspace_auth(),
        };

        let vm = &self.vm;
        let gateway = self.gateway.clone();
        vm.with_vm(spec, move |ssh, handle| async move {
            //keys go in before anyone can reach the workspace
            let keys_blob = authorized_keys_content(&args.authorized_keys);
            ssh.write_file(AUTHORIZED_KEYS_PATH, keys_blob.as_bytes())
                .await
                .context("could not install the authorized keys")?;
            ssh.exec(&["chmod", "700", "/home/hocus/.ssh"], ExecOpts::default())
                .await?;
            ssh.exec(&["chmod", "600", AUTHORIZED_KEYS_PATH], ExecOpts::default())
                .await?;

            upload_task_scripts(
                &ssh,
                WORKSPACE_SCRIPTS_DIR,
                args.tasks
                    .iter()
                    .enumerate()
                    .map(|(idx, command)| (idx as i32, command.as_str())),
            )
            .await?;

            let mut task_pids = Vec::with_capacity(args.tasks.len());
            for idx in 0..args.tasks.len() {
                let script = format!("{WORKSPACE_SCRIPTS_DIR}/task-{idx}.sh");
                let log = format!("{WORKSPACE_SCRIPTS_DIR}/task-{idx}.log");
                let launch = format!(
                    "bash {} > {} 2>&1 & echo \"$!\"",
                    shell_quote(&script),
                    shell_quote(&log)
                );
                let output = ssh
                    .exec(
                        &["bash", "-c", &launch],
                        ExecOpts {
                            cwd: Some(PROJECT_DIR.to_owned()),
                            ..Default::default()
                        },
                    )
                    .await
                    .with_context(|| format!("could not launch background task {idx}"))?;
                task_pids.push(parse_task_pid(&output.stdout)?);
            }

            vm.make_network_public(&handle).await?;
            gateway
                .add_public_keys_to_authorized_keys(&args.authorized_keys)
                .await
                .context("could not register the keys with the ssh gateway")?;

            tracing::info!(
                instance_id = %handle.instance_id,
                vm_ip = %handle.network.vm_ip,
                "workspace is up and public"
            );
            Ok(StartWorkspaceResult {
                instance_id: handle.instance_id.clone(),
                vmm_pid: handle.pid,
                vm_ip: handle.network.vm_ip.to_string(),
                ip_block_id: handle.ip_block_id,
                task_pids,
            })
        })
        .await
    }

    /// Releases a workspace started earlier, possibly by another agent
    /// process: the VMM pid comes from the pidfile recorded at boot.
    #[tracing::instrument(skip(self, args), fields(instance_id = %args.instance_id))]
    pub async fn stop_workspace(&self, args: StopWorkspaceArgs) -> Result<()> {
        let pid = match self.vm.recorded_pid(&args.instance_id).await {
            Some(pid) => pid,
            None => {
                tracing::warn!("no recorded vmm pid, relying on the control socket only");
                0
            }
        };
        let handle = VmHandle {
            instance_id: args.instance_id.clone(),
            pid,
            network: network_for_block(args.ip_block_id),
            ip_block_id: args.ip_block_id,
            extra_drive_mounts: Vec::new(),
        };
        self.vm.shutdown_and_release(&handle).await
    }
}

fn authorized_keys_content(keys: &[String]) -> String {
    let mut joined = keys.join("\n");
    joined.push('\n');
    joined
}

fn parse_task_pid(stdout: &[u8]) -> Result<u32> {
    let raw = std::str::from_utf8(stdout).unwrap_or("").trim();
    match raw.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(AgentError::ValidationFailed(format!(
            "task launcher answered {raw:?} instead of a positive pid"
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_capture_accepts_a_positive_integer() {
        assert_eq!(parse_task_pid(b"4242\n").unwrap(), 4242);
        assert_eq!(parse_task_pid(b"  7 ").unwrap(), 7);
    }

    #[test]
    fn pid_capture_rejects_zero_and_garbage() {
        for junk in [&b"0"[..], b"", b"-5", b"lots of text", b"12 34"] {
            let err = parse_task_pid(junk).expect_err("junk pid must be rejected");
            assert!(matches!(
                err.downcast_ref::<AgentError>(),
                Some(AgentError::ValidationFailed(_))
            ));
        }
    }

    #[test]
    fn authorized_keys_are_newline_joined_with_a_trailing_newline() {
        let keys = vec!["ssh-ed25519 AAA user@a".to_owned(), "ssh-rsa BBB user@b".to_owned()];
        assert_eq!(
            authorized_keys_content(&keys),
            "ssh-ed25519 AAA user@a\nssh-rsa BBB user@b\n"
        );
    }
}
