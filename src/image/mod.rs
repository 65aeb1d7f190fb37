use std::path::Path;

use crate::error::UpdateError;
use crate::runner::Runner;

// Packs a directory tree into a single read-only squashfs image. The image
// path must be fresh; choosing a collision-free slot is the caller's job and
// an existing file here means the slot discipline was violated.
pub struct ImageBuilder<'a> {
    runner: &'a dyn Runner,
}

impl<'a> ImageBuilder<'a> {
    pub fn new(runner: &'a dyn Runner) -> Self {
        ImageBuilder { runner }
    }

    pub fn build(&self, src_dir: &Path, image: &Path) -> Result<(), UpdateError> {
        if image.exists() {
            return Err(UpdateError::ImageBuildFailed {
                dir: src_dir.to_path_buf(),
                image: image.to_path_buf(),
                reason: "image path already exists".to_string(),
            });
        }

        let src = src_dir.display().to_string();
        let img = image.display().to_string();
        let output = self
            .runner
            .run(
                None,
                "mksquashfs",
                &[&src, &img, "-noappend", "-no-progress"],
            )
            .map_err(|reason| UpdateError::ImageBuildFailed {
                dir: src_dir.to_path_buf(),
                image: image.to_path_buf(),
                reason,
            })?;

        if !output.success() {
            return Err(UpdateError::ImageBuildFailed {
                dir: src_dir.to_path_buf(),
                image: image.to_path_buf(),
                reason: format!("exit status {}: {}", output.status, output.stderr.trim()),
            });
        }

        Ok(())
    }
}
