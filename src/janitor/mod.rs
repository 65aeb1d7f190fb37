use std::fs;
use std::path::{Path, PathBuf};

use utils::{log_info, log_warning};
use walkdir::WalkDir;

use crate::error::UpdateError;
use crate::mounts::{MountManager, UnmountReport};
use crate::runner::Runner;

// One overlay image mounted into the live tree
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayMount {
    pub image: PathBuf,
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    // Some live symlink resolves into this mount
    Referenced,
    // Nothing points here anymore
    Orphaned,
}

// End-of-life reconciliation for overlay mounts. Mount state is always
// re-read from the mounts table, never trusted from memory, so overlays
// that survived a process restart are still found.
pub struct OverlayJanitor<'a> {
    runner: &'a dyn Runner,
    mounts: MountManager<'a>,
}

impl<'a> OverlayJanitor<'a> {
    pub fn new(runner: &'a dyn Runner, mounts: MountManager<'a>) -> Self {
        OverlayJanitor { runner, mounts }
    }

    // Active overlay mounts under the mount base, straight from the mounts
    // table
    pub fn discover(&self, mount_base: &Path) -> Result<Vec<OverlayMount>, UpdateError> {
        let entries = self.mounts.read_active_mounts(mount_base)?;
        Ok(entries
            .into_iter()
            .map(|entry| OverlayMount {
                image: self.backing_image(&entry.device),
                mount_point: entry.path,
            })
            .collect())
    }

    // The kernel reports a loop-mounted image as /dev/loopN in the device
    // field; the backing file has to be asked for. Other device values are
    // taken as-is.
    fn backing_image(&self, device: &str) -> PathBuf {
        if !device.starts_with("/dev/loop") {
            return PathBuf::from(device);
        }
        match self.runner.run(
            None,
            "losetup",
            &["--noheadings", "--output", "BACK-FILE", device],
        ) {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                PathBuf::from(output.stdout.trim())
            }
            _ => {
                log_warning!("Could not resolve backing file of {}", device);
                PathBuf::from(device)
            }
        }
    }

    // Classify overlays by walking the live root for symlinks and resolving
    // each to its target
    pub fn scan(
        &self,
        live_root: &Path,
        overlays: Vec<OverlayMount>,
    ) -> Vec<(OverlayMount, OverlayState)> {
        let targets = symlink_targets(live_root);

        overlays
            .into_iter()
            .map(|overlay| {
                let referenced = targets
                    .iter()
                    .any(|target| target.starts_with(&overlay.mount_point));
                let state = if referenced {
                    OverlayState::Referenced
                } else {
                    OverlayState::Orphaned
                };
                (overlay, state)
            })
            .collect()
    }

    // Unmount every orphaned overlay and unlink its backing image.
    // Referenced mounts are never touched. Returns the removed images.
    pub fn reclaim(&self, classified: &[(OverlayMount, OverlayState)]) -> Vec<PathBuf> {
        let mut removed = Vec::new();

        for (overlay, state) in classified {
            if *state != OverlayState::Orphaned {
                continue;
            }

            let mp = overlay.mount_point.display().to_string();
            match self.runner.run(None, "umount", &[&mp]) {
                Ok(output) if output.success() => {
                    log_info!("Reclaimed orphaned overlay at {}", mp);
                }
                Ok(output) => {
                    // Still mounted; deleting the backing file now would
                    // pull the tree out from under the kernel
                    log_warning!("Failed to unmount orphan {}: exit status {}", mp, output.status);
                    continue;
                }
                Err(reason) => {
                    log_warning!("Failed to unmount orphan {}: {}", mp, reason);
                    continue;
                }
            }

            // Only regular files are unlinked; an unresolved /dev/loopN
            // stays untouched
            if overlay.image.is_file() {
                match fs::remove_file(&overlay.image) {
                    Ok(()) => removed.push(overlay.image.clone()),
                    Err(e) => {
                        log_warning!("Failed to remove {}: {}", overlay.image.display(), e)
                    }
                }
            }
        }

        removed
    }

    // Full reverse-order unmount of everything under the installation
    // target, regardless of reference state. Leftovers are reported, not
    // raised; aborting the installation is the caller's call.
    pub fn final_teardown(&self, mount_root: &Path) -> Result<UnmountReport, UpdateError> {
        let entries = self.mounts.read_active_mounts(mount_root)?;
        Ok(self.mounts.unmount_all(&entries, mount_root))
    }
}

// Every symlink target under the live root, resolved against the link's
// parent directory when relative
fn symlink_targets(live_root: &Path) -> Vec<PathBuf> {
    let mut targets = Vec::new();

    for entry in WalkDir::new(live_root).into_iter().flatten() {
        if !entry.path_is_symlink() {
            continue;
        }
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        let resolved = if target.is_absolute() {
            target
        } else {
            match entry.path().parent() {
                Some(parent) => parent.join(target),
                None => target,
            }
        };
        targets.push(resolved);
    }

    targets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunOutput;
    use std::cell::RefCell;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct FakeRunner {
        calls: RefCell<Vec<Vec<String>>>,
        table_path: Option<PathBuf>,
        // losetup answers: device -> backing file
        loop_backing: Vec<(String, PathBuf)>,
    }

    impl FakeRunner {
        fn new() -> Self {
            FakeRunner {
                calls: RefCell::new(Vec::new()),
                table_path: None,
                loop_backing: Vec::new(),
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

            if program == "umount"
                && let Some(table) = &self.table_path
            {
                let target = args[0];
                let contents = fs::read_to_string(table).unwrap_or_default();
                let kept: String = contents
                    .lines()
                    .filter(|line| line.split_whitespace().nth(1) != Some(target))
                    .map(|line| format!("{}\n", line))
                    .collect();
                fs::write(table, kept).unwrap();
            }

            if program == "losetup" {
                let device = args.last().copied().unwrap_or_default();
                let backing = self
                    .loop_backing
                    .iter()
                    .find(|(dev, _)| dev == device)
                    .map(|(_, file)| format!("{}\n", file.display()));
                return Ok(match backing {
                    Some(stdout) => RunOutput {
                        status: 0,
                        stdout,
                        stderr: String::new(),
                    },
                    None => RunOutput {
                        status: 1,
                        stdout: String::new(),
                        stderr: format!("losetup: {}: failed to use device", device),
                    },
                });
            }

            Ok(RunOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    struct Fixture {
        temp_dir: TempDir,
        table_path: PathBuf,
    }

    // Two overlays, the first referenced by a live symlink
    fn build_fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let mp0 = root.join("mounts/mp_0000");
        let mp1 = root.join("mounts/mp_0001");
        fs::create_dir_all(mp0.join("usr/bin")).unwrap();
        fs::create_dir_all(&mp1).unwrap();
        fs::write(mp0.join("usr/bin/tool"), b"bin").unwrap();

        let img0 = root.join("update_000");
        let img1 = root.join("update_001");
        fs::write(&img0, b"img0").unwrap();
        fs::write(&img1, b"img1").unwrap();

        let live = root.join("root/usr/bin");
        fs::create_dir_all(&live).unwrap();
        symlink(mp0.join("usr/bin/tool"), live.join("tool")).unwrap();

        let table_path = root.join("mounts_table");
        fs::write(
            &table_path,
            format!(
                "{} {} squashfs ro 0 0\n{} {} squashfs ro 0 0\n",
                img0.display(),
                mp0.display(),
                img1.display(),
                mp1.display()
            ),
        )
        .unwrap();

        Fixture {
            temp_dir,
            table_path,
        }
    }

    #[test]
    fn test_scan_classifies_referenced_and_orphaned() {
        let fixture = build_fixture();
        let root = fixture.temp_dir.path();
        let runner = FakeRunner::new();
        let mounts = MountManager::with_paths(
            &runner,
            fixture.table_path.to_str().unwrap(),
            root.join("registry").to_str().unwrap(),
        );
        let janitor = OverlayJanitor::new(&runner, mounts);

        let overlays = janitor.discover(&root.join("mounts")).unwrap();
        assert_eq!(overlays.len(), 2);

        let classified = janitor.scan(&root.join("root"), overlays);
        assert_eq!(classified[0].1, OverlayState::Referenced);
        assert_eq!(classified[1].1, OverlayState::Orphaned);
    }

    #[test]
    fn test_relative_symlink_references_an_overlay() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let mp = root.join("root/mounts/mp_0000");
        fs::create_dir_all(&mp).unwrap();
        fs::create_dir_all(root.join("root/etc")).unwrap();
        symlink("../mounts/mp_0000/config", root.join("root/etc/config")).unwrap();

        let runner = FakeRunner::new();
        let mounts = MountManager::with_paths(
            &runner,
            "/proc/mounts",
            root.join("registry").to_str().unwrap(),
        );
        let janitor = OverlayJanitor::new(&runner, mounts);

        let overlays = vec![OverlayMount {
            image: root.join("update_000"),
            mount_point: mp,
        }];
        let classified = janitor.scan(&root.join("root"), overlays);
        assert_eq!(classified[0].1, OverlayState::Referenced);
    }

    #[test]
    fn test_reclaim_removes_only_orphans() {
        let fixture = build_fixture();
        let root = fixture.temp_dir.path();
        let mut runner = FakeRunner::new();
        runner.table_path = Some(fixture.table_path.clone());
        let mounts = MountManager::with_paths(
            &runner,
            fixture.table_path.to_str().unwrap(),
            root.join("registry").to_str().unwrap(),
        );
        let janitor = OverlayJanitor::new(&runner, mounts);

        let overlays = janitor.discover(&root.join("mounts")).unwrap();
        let classified = janitor.scan(&root.join("root"), overlays);
        let removed = janitor.reclaim(&classified);

        // Only the orphan's image was unlinked
        assert_eq!(removed, vec![root.join("update_001")]);
        assert!(root.join("update_000").exists());
        assert!(!root.join("update_001").exists());

        // And only the orphan was unmounted
        let calls = runner.calls.borrow();
        let umounts: Vec<&Vec<String>> = calls.iter().filter(|c| c[0] == "umount").collect();
        assert_eq!(umounts.len(), 1);
        assert!(umounts[0][1].ends_with("mp_0001"));
    }

    #[test]
    fn test_discover_resolves_loop_device_backing_file() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let img = root.join("update_000");
        fs::write(&img, b"img").unwrap();
        let mp = root.join("mounts/mp_0000");
        fs::create_dir_all(&mp).unwrap();

        // The kernel table shows the loop device, not the image
        let table_path = root.join("mounts_table");
        fs::write(
            &table_path,
            format!("/dev/loop0 {} squashfs ro 0 0\n", mp.display()),
        )
        .unwrap();

        let mut runner = FakeRunner::new();
        runner
            .loop_backing
            .push(("/dev/loop0".to_string(), img.clone()));
        let mounts = MountManager::with_paths(
            &runner,
            table_path.to_str().unwrap(),
            root.join("registry").to_str().unwrap(),
        );
        let janitor = OverlayJanitor::new(&runner, mounts);

        let overlays = janitor.discover(&root.join("mounts")).unwrap();
        assert_eq!(overlays.len(), 1);
        assert_eq!(overlays[0].image, img);
        assert_eq!(overlays[0].mount_point, mp);
    }

    #[test]
    fn test_reclaim_unlinks_backing_file_of_loop_mounted_orphan() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let img = root.join("update_000");
        fs::write(&img, b"img").unwrap();
        let mp = root.join("mounts/mp_0000");
        fs::create_dir_all(&mp).unwrap();

        let table_path = root.join("mounts_table");
        fs::write(
            &table_path,
            format!("/dev/loop0 {} squashfs ro 0 0\n", mp.display()),
        )
        .unwrap();

        let mut runner = FakeRunner::new();
        runner.table_path = Some(table_path.clone());
        runner
            .loop_backing
            .push(("/dev/loop0".to_string(), img.clone()));
        let mounts = MountManager::with_paths(
            &runner,
            table_path.to_str().unwrap(),
            root.join("registry").to_str().unwrap(),
        );
        let janitor = OverlayJanitor::new(&runner, mounts);

        // No symlinks reference the mount, so it is an orphan
        let overlays = janitor.discover(&root.join("mounts")).unwrap();
        let classified = janitor.scan(&root.join("root"), overlays);
        assert_eq!(classified[0].1, OverlayState::Orphaned);

        let removed = janitor.reclaim(&classified);
        assert_eq!(removed, vec![img.clone()]);
        assert!(!img.exists());
    }

    #[test]
    fn test_unresolvable_loop_device_is_never_unlinked() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let mp = root.join("mounts/mp_0000");
        fs::create_dir_all(&mp).unwrap();

        let table_path = root.join("mounts_table");
        fs::write(
            &table_path,
            format!("/dev/loop7 {} squashfs ro 0 0\n", mp.display()),
        )
        .unwrap();

        // losetup knows nothing about loop7
        let mut runner = FakeRunner::new();
        runner.table_path = Some(table_path.clone());
        let mounts = MountManager::with_paths(
            &runner,
            table_path.to_str().unwrap(),
            root.join("registry").to_str().unwrap(),
        );
        let janitor = OverlayJanitor::new(&runner, mounts);

        let overlays = janitor.discover(&root.join("mounts")).unwrap();
        assert_eq!(overlays[0].image, PathBuf::from("/dev/loop7"));

        let classified = janitor.scan(&root.join("root"), overlays);
        let removed = janitor.reclaim(&classified);
        // The mount is released but nothing is unlinked
        assert!(removed.is_empty());
        let calls = runner.calls.borrow();
        assert!(calls.iter().any(|c| c[0] == "umount"));
    }

    #[test]
    fn test_final_teardown_unmounts_everything_in_reverse() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let table_path = root.join("mounts_table");
        fs::write(
            &table_path,
            "/dev/sda2 /mnt ext4 rw 0 0\n\
             /dev/sda3 /mnt/usr ext4 rw 0 0\n\
             /dev/sda4 /mnt/usr/local ext4 rw 0 0\n",
        )
        .unwrap();

        let mut runner = FakeRunner::new();
        runner.table_path = Some(table_path.clone());
        let mounts = MountManager::with_paths(
            &runner,
            table_path.to_str().unwrap(),
            root.join("registry").to_str().unwrap(),
        );
        let janitor = OverlayJanitor::new(&runner, mounts);

        let report = janitor.final_teardown(Path::new("/mnt")).unwrap();
        assert!(report.complete());
        assert_eq!(
            report.unmounted,
            vec![
                PathBuf::from("/mnt/usr/local"),
                PathBuf::from("/mnt/usr"),
                PathBuf::from("/mnt"),
            ]
        );
    }
}
