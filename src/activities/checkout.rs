use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{Agent, WORKDIR, WORKDIR_PROJECT};
use crate::error::AgentError;
use crate::ssh::{ExecOpts, SshSession};
use crate::vm::{image, ExtraDrive, VmSpec};

/// Well-known config file at the root of the checked-out repository.
pub const PROJECT_CONFIG_FILE: &str = "hocus.yml";

/// Declarative per-repository configuration. Absence is fine; an
/// unparsable or unexpected shape is a validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(default)]
    pub image: Option<ImageConfig>,
    #[serde(default)]
    pub tasks: Vec<ProjectTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ImageConfig {
    pub file: String,
    #[serde(default)]
    pub build_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProjectTask {
    #[serde(default)]
    pub name: Option<String>,
    pub init: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutAndInspectArgs {
    pub root_fs_path: PathBuf,
    /// Drive with the fetched repository. Copied, never written to.
    pub repo_drive_path: PathBuf,
    pub output_drive_path: PathBuf,
    pub target_branch: String,
    pub instance_id: Option<String>,
}

impl Agent {
    /// Copies the repo drive, checks out the target branch on the copy
    /// and reads the optional project config. On any failure the output
    /// drive is deleted so no stale artifact survives.
    #[tracing::instrument(skip(self, args), fields(target_branch = %args.target_branch))]
    pub async fn checkout_and_inspect(
        &self,
        args: CheckoutAndInspectArgs,
    ) -> Result<Option<ProjectConfig>> {
        let output_drive_path = args.output_drive_path.clone();
        let result = self.checkout_inner(args).await;
        if result.is_err() {
            match tokio::fs::remove_file(&output_drive_path).await {
                Ok(()) => tracing::info!("deleted output drive after failed checkout"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(error = %err, "could not delete output drive after failure")
                }
            }
        }
        result
    }

    async fn checkout_inner(
        &self,
        args: CheckoutAndInspectArgs,
    ) -> Result<Option<ProjectConfig>> {
        image::copy_drive_image(&args.repo_drive_path, &args.output_drive_path).await?;

        let spec = VmSpec {
            instance_id: args
                .instance_id
                .clone()
                .unwrap_or_else(|| Self::generate_instance_id("checkout")),
            root_fs_path: args.root_fs_path.clone(),
            extra_drives: vec![ExtraDrive {
                path: args.output_drive_path.clone(),
                mount_path: Some(WORKDIR.to_owned()),
                read_only: false,
            }],
            should_poweroff: true,
            ssh_user: self.config.ssh_user.clone(),
            ssh_auth: self.config.boot_auth(),
        };

        self.vm
            .with_vm(spec, move |ssh, _handle| async move {
                ssh.exec(
                    &["git", "checkout", &args.target_branch],
                    ExecOpts {
                        cwd: Some(WORKDIR_PROJECT.to_owned()),
                        ..Default::default()
                    },
                )
                .await
                .with_context(|| {
                    format!("could not check out branch {}", args.target_branch)
                })?;

                read_project_config(&ssh).await
            })
            .await
    }
}

async fn read_project_config(ssh: &SshSession) -> Result<Option<ProjectConfig>> {
    let config_path = format!("{WORKDIR_PROJECT}/{PROJECT_CONFIG_FILE}");
    let probe = ssh
        .exec(
            &["test", "-f", &config_path],
            ExecOpts {
                allow_non_zero_exit_code: true,
                ..Default::default()
            },
        )
        .await?;
    if probe.code != 0 {
        tracing::debug!("repository has no project config file");
        return Ok(None);
    }
    let raw = ssh.exec(&["cat", &config_path], ExecOpts::default()).await?;
    parse_project_config(&raw.stdout).map(Some)
}

pub(crate) fn parse_project_config(bytes: &[u8]) -> Result<ProjectConfig> {
    serde_yaml::from_slice(bytes).map_err(|err| {
        AgentError::ValidationFailed(format!("project config file is invalid: {err}")).into()
    })
}
