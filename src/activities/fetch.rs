use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{Agent, DEV_DIR, PROJECT_DIR};
use crate::ssh::{ExecOpts, SshSession};
use crate::vm::{image, ExtraDrive, VmSpec};

/// Host-key checking is disabled on purpose so clones work against
/// arbitrary remotes without seeded known_hosts. Known weakness, kept
/// deliberately.
const GIT_SSH_COMMAND: &str =
    "ssh -o UserKnownHostsFile=/dev/null -o StrictHostKeyChecking=no";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRepositoryArgs {
    /// Per-project root filesystem; credentials are baked into it, so
    /// every project brings its own.
    pub root_fs_path: PathBuf,
    pub output_drive_path: PathBuf,
    pub output_drive_size_mib: u64,
    pub repository_url: String,
    /// Deploy key for private repositories, injected over sftp and never
    /// written to the drive.
    pub private_ssh_key: Option<String>,
    pub instance_id: Option<String>,
}

impl Agent {
    /// Clones or updates a repository on the output drive. Idempotent:
    /// the first run clones without a checkout, later runs fetch.
    #[tracing::instrument(skip(self, args), fields(repository_url = %args.repository_url))]
    pub async fn fetch_repository(&self, args: FetchRepositoryArgs) -> Result<()> {
        let drive_created = tokio::fs::metadata(&args.output_drive_path).await.is_err();
        if drive_created {
            image::create_ext4_image(&args.output_drive_path, args.output_drive_size_mib, false)
                .await?;
        }

        let spec = VmSpec {
            instance_id: args
                .instance_id
                .clone()
                .unwrap_or_else(|| Self::generate_instance_id("fetchrepo")),
            root_fs_path: args.root_fs_path.clone(),
            extra_drives: vec![ExtraDrive {
                path: args.output_drive_path.clone(),
                mount_path: Some(DEV_DIR.to_owned()),
                read_only: false,
            }],
            should_poweroff: true,
            ssh_user: self.config.ssh_user.clone(),
            ssh_auth: self.config.boot_auth(),
        };

        let user = self.config.ssh_user.clone();
        self.vm
            .with_vm(spec, move |ssh, _handle| async move {
                if drive_created {
                    //a fresh ext4 mount starts out owned by root
                    ssh.exec(
                        &[
                            "sudo",
                            "chown",
                            "-R",
                            &format!("{user}:{user}"),
                            DEV_DIR,
                        ],
                        ExecOpts::default(),
                    )
                    .await
                    .context("could not hand the fresh drive to the build user")?;
                }

                if let Some(key) = &args.private_ssh_key {
                    install_deploy_key(&ssh, &user, key).await?;
                }

                let probe = ssh
                    .exec(
                        &["test", "-d", &format!("{PROJECT_DIR}/.git")],
                        ExecOpts {
                            allow_non_zero_exit_code: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                let git_env = vec![("GIT_SSH_COMMAND".to_owned(), GIT_SSH_COMMAND.to_owned())];

                if probe.code == 0 {
                    tracing::info!("repository already on the drive, fetching");
                    ssh.exec(
                        &["git", "fetch", "--all"],
                        ExecOpts {
                            cwd: Some(PROJECT_DIR.to_owned()),
                            env: git_env,
                            ..Default::default()
                        },
                    )
                    .await
                    .context("git fetch failed")?;
                } else {
                    tracing::info!("no repository on the drive yet, cloning");
                    ssh.exec(
                        &[
                            "git",
                            "clone",
                            "--no-checkout",
                            &args.repository_url,
                            "project",
                        ],
                        ExecOpts {
                            cwd: Some(DEV_DIR.to_owned()),
                            env: git_env,
                            ..Default::default()
                        },
                    )
                    .await
                    .context("git clone failed")?;
                }
                Ok(())
            })
            .await
    }
}

/// Puts the deploy key at `~/.ssh/id_rsa` on a tmpfs mount so it lives in
/// guest memory only.
async fn install_deploy_key(ssh: &SshSession, user: &str, key: &str) -> Result<()> {
    let ssh_dir = format!("/home/{user}/.ssh");
    ssh.exec(
        &[
            "sudo",
            "bash",
            "-c",
            &format!(
                "mkdir -p {dir} && mount -t tmpfs -o mode=0700 tmpfs {dir} && chown {user}:{user} {dir}",
                dir = ssh_dir
            ),
        ],
        ExecOpts::default(),
    )
    .await
    .context("could not prepare a tmpfs for the deploy key")?;

    let key_path = format!("{ssh_dir}/id_rsa");
    ssh.write_file(&key_path, key.as_bytes()).await?;
    ssh.exec(&["chmod", "700", &ssh_dir], ExecOpts::default())
        .await?;
    ssh.exec(&["chmod", "400", &key_path], ExecOpts::default())
        .await?;
    Ok(())
}
