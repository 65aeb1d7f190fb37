use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use utils::{log_info, log_warning};

use crate::error::UpdateError;
use crate::runner::Runner;

const MOUNTS_TABLE: &str = "/proc/mounts";
const MOUNT_REGISTRY: &str = "/var/lib/instup/mounted_images";

// One active mount of interest
#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
    pub options: String,
}

// Everything a best-effort unmount pass has to say. Leftovers are reported,
// never raised; the caller decides whether they matter.
#[derive(Debug, Default)]
pub struct UnmountReport {
    pub unmounted: Vec<PathBuf>,
    pub leftover: Vec<LeftoverMount>,
}

#[derive(Debug)]
pub struct LeftoverMount {
    pub path: PathBuf,
    pub holders: Vec<String>,
}

impl UnmountReport {
    pub fn complete(&self) -> bool {
        self.leftover.is_empty()
    }
}

pub struct MountManager<'a> {
    runner: &'a dyn Runner,
    mounts_table: PathBuf,
    registry: PathBuf,
}

impl<'a> MountManager<'a> {
    pub fn new(runner: &'a dyn Runner) -> Self {
        Self::with_paths(runner, MOUNTS_TABLE, MOUNT_REGISTRY)
    }

    // Custom table/registry paths (mainly for testing)
    pub fn with_paths(runner: &'a dyn Runner, mounts_table: &str, registry: &str) -> Self {
        MountManager {
            runner,
            mounts_table: PathBuf::from(mounts_table),
            registry: PathBuf::from(registry),
        }
    }

    // Mount an image read-only at the given point, creating the point if
    // missing. Success is verified by exit status; every successful mount
    // is appended to the write-only registry for post-mortem diagnostics.
    pub fn mount(&self, image: &Path, mount_point: &Path) -> Result<(), UpdateError> {
        fs::create_dir_all(mount_point)?;

        let img = image.display().to_string();
        let mp = mount_point.display().to_string();
        let output = self
            .runner
            .run(None, "mount", &["-o", "ro,loop", &img, &mp])
            .map_err(|reason| UpdateError::MountFailed {
                image: image.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                reason,
            })?;

        if !output.success() {
            return Err(UpdateError::MountFailed {
                image: image.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                reason: format!("exit status {}: {}", output.status, output.stderr.trim()),
            });
        }

        log_info!("Mounted {} at {}", image.display(), mount_point.display());
        self.record_mount(image, mount_point);
        Ok(())
    }

    fn record_mount(&self, image: &Path, mount_point: &Path) {
        if let Some(parent) = self.registry.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let line = format!("{} -> {}\n", image.display(), mount_point.display());
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.registry)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if written.is_err() {
            log_warning!("Failed to record mount of {}", image.display());
        }
    }

    // Parse the kernel mounts table, keeping only entries under `prefix`
    pub fn read_active_mounts(&self, prefix: &Path) -> Result<Vec<MountEntry>, UpdateError> {
        let table = fs::read_to_string(&self.mounts_table)?;
        Ok(parse_mounts(&table, prefix))
    }

    // Unmount every entry, children before parents. Failures are logged and
    // the pass continues; afterwards a fresh table read determines what is
    // still mounted, and each leftover is annotated with the processes
    // holding it open.
    pub fn unmount_all(&self, entries: &[MountEntry], prefix: &Path) -> UnmountReport {
        let mut report = UnmountReport::default();

        for path in unmount_order(entries) {
            let mp = path.display().to_string();
            match self.runner.run(None, "umount", &[&mp]) {
                Ok(output) if output.success() => {
                    log_info!("Unmounted {}", mp);
                    report.unmounted.push(path.clone());
                }
                Ok(output) => {
                    log_warning!(
                        "Failed to unmount {}: exit status {}",
                        mp,
                        output.status
                    );
                }
                Err(reason) => {
                    log_warning!("Failed to unmount {}: {}", mp, reason);
                }
            }
        }

        let still_mounted = self.read_active_mounts(prefix).unwrap_or_default();
        for entry in entries {
            if still_mounted.iter().any(|m| m.path == entry.path) {
                report.leftover.push(LeftoverMount {
                    holders: self.holders_of(&entry.path),
                    path: entry.path.clone(),
                });
            }
        }

        report
    }

    // Processes still holding a path open, for diagnostics only
    fn holders_of(&self, path: &Path) -> Vec<String> {
        let mp = path.display().to_string();
        match self.runner.run(None, "fuser", &[&mp]) {
            Ok(output) => output
                .stdout
                .split_whitespace()
                .map(|pid| pid.to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

// One entry per line: device, path, fs_type, options. Blank lines and
// comments are skipped, as are paths outside the tracked prefix. A btrfs
// line whose device is already tracked is a subvolume of that mount and is
// implied by it; this relies on the kernel listing parents first.
pub fn parse_mounts(table: &str, prefix: &Path) -> Vec<MountEntry> {
    let mut entries: Vec<MountEntry> = Vec::new();

    for line in table.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(device), Some(path), Some(fs_type)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let options = fields.next().unwrap_or("").to_string();

        let path = PathBuf::from(path);
        if !path.starts_with(prefix) {
            continue;
        }

        if fs_type == "btrfs"
            && entries
                .iter()
                .any(|e| e.fs_type == "btrfs" && e.device == device)
        {
            continue;
        }

        entries.push(MountEntry {
            device: device.to_string(),
            path,
            fs_type: fs_type.to_string(),
            options,
        });
    }

    entries
}

// The mounts table lists parents before children, so reversing the
// discovery order unmounts children first.
pub fn unmount_order(entries: &[MountEntry]) -> Vec<PathBuf> {
    entries.iter().rev().map(|e| e.path.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunOutput;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct FakeRunner {
        calls: RefCell<Vec<Vec<String>>>,
        // Paths whose umount should fail
        stuck: Vec<String>,
        // Rewritten on each successful umount to mimic the kernel table
        table_path: Option<PathBuf>,
    }

    impl FakeRunner {
        fn new() -> Self {
            FakeRunner {
                calls: RefCell::new(Vec::new()),
                stuck: Vec::new(),
                table_path: None,
            }
        }
    }

    impl Runner for FakeRunner {
        fn run(
            &self,
            _cwd: Option<&Path>,
            program: &str,
            args: &[&str],
        ) -> Result<RunOutput, String> {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().map(|a| a.to_string()));
            self.calls.borrow_mut().push(call);

            match program {
                "umount" => {
                    let target = args[0];
                    if self.stuck.iter().any(|s| s == target) {
                        return Ok(RunOutput {
                            status: 32,
                            stdout: String::new(),
                            stderr: "target is busy".to_string(),
                        });
                    }
                    if let Some(table) = &self.table_path {
                        let contents = fs::read_to_string(table).unwrap_or_default();
                        let kept: String = contents
                            .lines()
                            .filter(|line| {
                                line.split_whitespace().nth(1) != Some(target)
                            })
                            .map(|line| format!("{}\n", line))
                            .collect();
                        fs::write(table, kept).unwrap();
                    }
                    Ok(RunOutput {
                        status: 0,
                        stdout: String::new(),
                        stderr: String::new(),
                    })
                }
                "fuser" => Ok(RunOutput {
                    status: 0,
                    stdout: "101 202".to_string(),
                    stderr: String::new(),
                }),
                _ => Ok(RunOutput {
                    status: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                }),
            }
        }
    }

    #[test]
    fn test_parse_skips_comments_and_foreign_paths() {
        let table = "\n\
            # kernel table\n\
            /dev/sda2 /mnt ext4 rw 0 0\n\
            /dev/sda3 /other ext4 rw 0 0\n\
            proc /proc proc rw 0 0\n";
        let entries = parse_mounts(table, Path::new("/mnt"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, PathBuf::from("/mnt"));
        assert_eq!(entries[0].fs_type, "ext4");
    }

    #[test]
    fn test_parse_skips_btrfs_subvolumes() {
        let table = "\
            /dev/sda2 /mnt btrfs rw,subvol=/@ 0 0\n\
            /dev/sda2 /mnt/home btrfs rw,subvol=/@/home 0 0\n\
            /dev/sdb1 /mnt/data btrfs rw 0 0\n";
        let entries = parse_mounts(table, Path::new("/mnt"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, PathBuf::from("/mnt"));
        assert_eq!(entries[1].path, PathBuf::from("/mnt/data"));
    }

    #[test]
    fn test_unmount_order_is_reverse_of_discovery() {
        let table = "\
            /dev/sda2 /mnt ext4 rw 0 0\n\
            /dev/sda3 /mnt/usr ext4 rw 0 0\n\
            /dev/sda4 /mnt/usr/local ext4 rw 0 0\n";
        let entries = parse_mounts(table, Path::new("/mnt"));
        let order = unmount_order(&entries);
        assert_eq!(
            order,
            vec![
                PathBuf::from("/mnt/usr/local"),
                PathBuf::from("/mnt/usr"),
                PathBuf::from("/mnt"),
            ]
        );
    }

    #[test]
    fn test_mount_creates_point_and_records_registry() {
        let temp_dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let registry = temp_dir.path().join("registry");
        let manager = MountManager::with_paths(
            &runner,
            "/proc/mounts",
            registry.to_str().unwrap(),
        );

        let image = temp_dir.path().join("update_000");
        let mount_point = temp_dir.path().join("mp_0000");
        manager.mount(&image, &mount_point).unwrap();

        assert!(mount_point.is_dir());
        let calls = runner.calls.borrow();
        assert_eq!(calls[0][0], "mount");
        assert_eq!(calls[0][2], "ro,loop");

        let recorded = fs::read_to_string(&registry).unwrap();
        assert!(recorded.contains("update_000"));
        assert!(recorded.contains("->"));
        assert!(recorded.contains("mp_0000"));
    }

    #[test]
    fn test_unmount_all_reports_leftovers_with_holders() {
        let temp_dir = TempDir::new().unwrap();
        let table_path = temp_dir.path().join("mounts");
        fs::write(
            &table_path,
            "/dev/sda2 /mnt ext4 rw 0 0\n/dev/sda3 /mnt/usr ext4 rw 0 0\n",
        )
        .unwrap();

        let mut runner = FakeRunner::new();
        runner.stuck.push("/mnt/usr".to_string());
        runner.table_path = Some(table_path.clone());

        let manager = MountManager::with_paths(
            &runner,
            table_path.to_str().unwrap(),
            temp_dir.path().join("registry").to_str().unwrap(),
        );

        let entries = manager.read_active_mounts(Path::new("/mnt")).unwrap();
        let report = manager.unmount_all(&entries, Path::new("/mnt"));

        assert!(!report.complete());
        assert_eq!(report.unmounted, vec![PathBuf::from("/mnt")]);
        assert_eq!(report.leftover.len(), 1);
        assert_eq!(report.leftover[0].path, PathBuf::from("/mnt/usr"));
        assert_eq!(report.leftover[0].holders, vec!["101", "202"]);
    }

    #[test]
    fn test_unmount_all_clean_pass() {
        let temp_dir = TempDir::new().unwrap();
        let table_path = temp_dir.path().join("mounts");
        fs::write(
            &table_path,
            "/dev/sda2 /mnt ext4 rw 0 0\n/dev/sda3 /mnt/usr ext4 rw 0 0\n",
        )
        .unwrap();

        let mut runner = FakeRunner::new();
        runner.table_path = Some(table_path.clone());

        let manager = MountManager::with_paths(
            &runner,
            table_path.to_str().unwrap(),
            temp_dir.path().join("registry").to_str().unwrap(),
        );

        let entries = manager.read_active_mounts(Path::new("/mnt")).unwrap();
        let report = manager.unmount_all(&entries, Path::new("/mnt"));

        assert!(report.complete());
        // Children first
        assert_eq!(
            report.unmounted,
            vec![PathBuf::from("/mnt/usr"), PathBuf::from("/mnt")]
        );
    }
}
