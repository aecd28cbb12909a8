use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::cmd;

/// Creates a zero-filled ext4 image of `size_mib` at `path`.
///
/// Refuses to touch an existing file unless `overwrite` is set, in which
/// case the image is recreated from scratch.
pub async fn create_ext4_image(path: &Path, size_mib: u64, overwrite: bool) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(_) if overwrite => {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("could not remove old image {}", path.display()))?;
        }
        Ok(_) => bail!(
            "refusing to overwrite existing image at {}",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("could not stat {}", path.display()))
        }
    }

    //a sparse file reads back as zeroes, which is all mkfs needs
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("could not create image file {}", path.display()))?;
    file.set_len(size_mib * 1024 * 1024)
        .await
        .context("could not size image file")?;
    file.sync_all().await.context("could not sync image file")?;
    drop(file);

    let path_str = path
        .to_str()
        .with_context(|| format!("image path {} is not valid utf-8", path.display()))?;
    cmd::run_checked(&["mkfs.ext4", "-q", path_str])
        .await
        .context("mkfs.ext4 failed")?;
    tracing::debug!(path = %path.display(), size_mib, "ext4 image created");
    Ok(())
}

/// Copies a drive image on the host, warning when the target is replaced.
pub async fn copy_drive_image(source: &Path, target: &Path) -> Result<()> {
    if tokio::fs::metadata(target).await.is_ok() {
        tracing::warn!(target = %target.display(), "overwriting existing drive image");
    }
    tokio::fs::copy(source, target).await.with_context(|| {
        format!(
            "could not copy drive {} to {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_to_overwrite_without_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.ext4");
        tokio::fs::write(&path, b"do not eat me").await.unwrap();

        let err = create_ext4_image(&path, 16, false)
            .await
            .expect_err("existing image must be refused");
        assert!(format!("{err:#}").contains("refusing to overwrite"));
        //the original file is untouched
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"do not eat me");
    }

    #[tokio::test]
    #[ignore = "needs mkfs.ext4 on the host"]
    async fn overwrite_recreates_the_image_at_the_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.ext4");
        tokio::fs::write(&path, b"stale").await.unwrap();

        create_ext4_image(&path, 16, true).await.unwrap();
        let len = tokio::fs::metadata(&path).await.unwrap().len();
        assert_eq!(len, 16 * 1024 * 1024);
    }

    #[tokio::test]
    async fn copy_replaces_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.ext4");
        let target = dir.path().join("dst.ext4");
        tokio::fs::write(&source, b"fresh").await.unwrap();
        tokio::fs::write(&target, b"stale").await.unwrap();

        copy_drive_image(&source, &target).await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"fresh");
    }
}
