use std::fs;
use std::path::Path;

use crate::error::UpdateError;
use crate::runner::{Runner, run_shell};

// Unpacks one downloaded package into a working directory through an
// external decompression pipeline. Never partially succeeds silently: a
// non-zero exit from the pipeline is a typed error.
pub struct ArchiveExtractor<'a> {
    runner: &'a dyn Runner,
}

impl<'a> ArchiveExtractor<'a> {
    pub fn new(runner: &'a dyn Runner) -> Self {
        ArchiveExtractor { runner }
    }

    pub fn extract(&self, archive: &Path, dest: &Path) -> Result<(), UpdateError> {
        fs::create_dir_all(dest)?;

        // Packages are rpm payloads; driver-update archives are gzipped cpio
        let is_rpm = archive.extension().is_some_and(|ext| ext == "rpm");
        let script = if is_rpm {
            format!(
                "rpm2cpio '{}' | cpio --extract --make-directories --preserve-modification-time --quiet",
                archive.display()
            )
        } else {
            format!(
                "gzip -dc '{}' | cpio --extract --make-directories --preserve-modification-time --quiet",
                archive.display()
            )
        };

        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| archive.display().to_string());

        let output = run_shell(self.runner, Some(dest), &script).map_err(|reason| {
            UpdateError::ExtractionFailed {
                package: name.clone(),
                reason,
            }
        })?;

        if !output.success() {
            return Err(UpdateError::ExtractionFailed {
                package: name,
                reason: format!("exit status {}: {}", output.status, output.stderr.trim()),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunOutput;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct CannedRunner {
        status: i32,
        calls: RefCell<Vec<(Option<std::path::PathBuf>, String, Vec<String>)>>,
    }

    impl Runner for CannedRunner {
        fn run(
            &self,
            cwd: Option<&Path>,
            program: &str,
            args: &[&str],
        ) -> Result<RunOutput, String> {
            self.calls.borrow_mut().push((
                cwd.map(|p| p.to_path_buf()),
                program.to_string(),
                args.iter().map(|a| a.to_string()).collect(),
            ));
            Ok(RunOutput {
                status: self.status,
                stdout: String::new(),
                stderr: String::from("boom"),
            })
        }
    }

    #[test]
    fn test_extract_runs_rpm_pipeline_in_dest() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("work");
        let runner = CannedRunner {
            status: 0,
            calls: RefCell::new(Vec::new()),
        };

        let extractor = ArchiveExtractor::new(&runner);
        extractor
            .extract(&temp_dir.path().join("pkg-1.0.x86_64.rpm"), &dest)
            .unwrap();

        let calls = runner.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_deref(), Some(dest.as_path()));
        assert_eq!(calls[0].1, "sh");
        assert!(calls[0].2[1].contains("rpm2cpio"));
        assert!(dest.exists());
    }

    #[test]
    fn test_non_rpm_uses_gzip_pipeline() {
        let temp_dir = TempDir::new().unwrap();
        let runner = CannedRunner {
            status: 0,
            calls: RefCell::new(Vec::new()),
        };

        let extractor = ArchiveExtractor::new(&runner);
        extractor
            .extract(&temp_dir.path().join("driver.dud"), &temp_dir.path().join("work"))
            .unwrap();

        let calls = runner.calls.borrow();
        assert!(calls[0].2[1].contains("gzip -dc"));
    }

    #[test]
    fn test_nonzero_exit_fails_loudly() {
        let temp_dir = TempDir::new().unwrap();
        let runner = CannedRunner {
            status: 2,
            calls: RefCell::new(Vec::new()),
        };

        let extractor = ArchiveExtractor::new(&runner);
        let err = extractor
            .extract(&temp_dir.path().join("pkg.rpm"), &temp_dir.path().join("work"))
            .unwrap_err();

        match err {
            UpdateError::ExtractionFailed { package, reason } => {
                assert_eq!(package, "pkg.rpm");
                assert!(reason.contains("exit status 2"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
