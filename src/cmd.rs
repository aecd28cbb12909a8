use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Runs a host command to completion and fails with its stderr if it
/// exits non-zero.
pub(crate) async fn run_checked(argv: &[&str]) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .context("host command needs at least a program name")?;
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to spawn `{program}`"))?;
    if !output.status.success() {
        bail!(
            "`{}` failed: {}",
            argv.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
