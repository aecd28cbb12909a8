use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{Agent, WORKDIR};
use crate::ssh::ExecOpts;
use crate::vm::{image, ExtraDrive, VmSpec};

const INPUT_DIR: &str = "/tmp/input";
const OUTPUT_DIR: &str = "/tmp/output";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFsArgs {
    /// Root filesystem of the disposable builder VM.
    pub builder_fs_path: PathBuf,
    /// The bootable image this build produces. Always recreated.
    pub output_fs_path: PathBuf,
    pub output_size_mib: u64,
    /// Drive holding the fetched repository, attached read-only.
    pub repo_drive_path: PathBuf,
    /// Dockerfile location, relative to the repository drive.
    pub dockerfile_path: String,
    /// Build context, relative to the repository drive.
    pub context_path: String,
    /// Host directory with `buildfs.sh` and its helpers.
    pub resources_dir: PathBuf,
    pub instance_id: Option<String>,
}

impl Agent {
    /// Builds a bootable root filesystem from a Dockerfile inside a
    /// disposable builder VM.
    #[tracing::instrument(skip(self, args), fields(output = %args.output_fs_path.display()))]
    pub async fn build_fs(&self, args: BuildFsArgs) -> Result<()> {
        //the output image is rebuilt from scratch on every run
        image::create_ext4_image(&args.output_fs_path, args.output_size_mib, true).await?;

        let spec = VmSpec {
            instance_id: args
                .instance_id
                .clone()
                .unwrap_or_else(|| Self::generate_instance_id("buildfs")),
            root_fs_path: args.builder_fs_path.clone(),
            extra_drives: vec![
                ExtraDrive {
                    path: args.repo_drive_path.clone(),
                    mount_path: Some(INPUT_DIR.to_owned()),
                    read_only: true,
                },
                ExtraDrive {
                    path: args.output_fs_path.clone(),
                    mount_path: Some(OUTPUT_DIR.to_owned()),
                    read_only: false,
                },
            ],
            should_poweroff: true,
            ssh_user: self.config.ssh_user.clone(),
            ssh_auth: self.config.boot_auth(),
        };

        self.vm
            .with_vm(spec, move |ssh, _handle| async move {
                ssh.put_directory(&args.resources_dir, WORKDIR)
                    .await
                    .context("could not upload the build scripts")?;
                let script = format!("{WORKDIR}/buildfs.sh");
                ssh.exec(&["chmod", "+x", &script], ExecOpts::default())
                    .await?;

                let dockerfile = format!("{INPUT_DIR}/{}", args.dockerfile_path);
                let context = format!("{INPUT_DIR}/{}", args.context_path);
                ssh.exec(
                    &["sudo", &script, &dockerfile, OUTPUT_DIR, &context],
                    ExecOpts::default(),
                )
                .await
                .context("buildfs.sh failed")?;
                Ok(())
            })
            .await
    }
}
