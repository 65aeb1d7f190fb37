use std::path::Path;
use std::process::Command;

// Captured result of one external tool invocation
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

// Every external tool (mount, umount, mksquashfs, cpio, rpm, fuser, the
// splice helper) is invoked through this trait so the pipeline can be
// exercised with recorded invocations and canned exit statuses.
pub trait Runner {
    fn run(&self, cwd: Option<&Path>, program: &str, args: &[&str]) -> Result<RunOutput, String>;
}

// Shell helper for pipelines such as `rpm2cpio x | cpio ...`
pub fn run_shell(
    runner: &dyn Runner,
    cwd: Option<&Path>,
    script: &str,
) -> Result<RunOutput, String> {
    runner.run(cwd, "sh", &["-c", script])
}

// Runner backed by real processes
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, cwd: Option<&Path>, program: &str, args: &[&str]) -> Result<RunOutput, String> {
        let mut command = Command::new(program);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .map_err(|e| format!("Failed to run {}: {}", program, e))?;

        Ok(RunOutput {
            // Killed-by-signal shows up as no exit code; treat it as failure
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
