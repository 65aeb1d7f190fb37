use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use utils::{log_debug, log_info};
use walkdir::WalkDir;

use crate::config::OriginKind;
use crate::error::UpdateError;
use crate::extract::ArchiveExtractor;
use crate::image::ImageBuilder;
use crate::mounts::MountManager;
use crate::repo::{PackageInfo, ProbeOutcome, RepoClient, RepoHandle};
use crate::runner::Runner;
use crate::version;

// Packages providing one of these are add-on extensions, never applied to
// the running installation environment itself
const ADDON_PROVIDES: [&str; 2] = ["installer_module_extension()", "self_update_addon()"];

// Subtrees that never matter inside the live root
const IRRELEVANT_SUBTREES: [&str; 3] =
    ["usr/share/doc", "usr/share/man", "var/adm/fillup-templates"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub arch: String,
}

impl Package {
    // The line format of the applied-package index
    pub fn index_line(&self) -> String {
        format!("{} [{}.{}]", self.name, self.version, self.arch)
    }
}

impl From<&PackageInfo> for Package {
    fn from(info: &PackageInfo) -> Self {
        Package {
            name: info.name.clone(),
            version: info.version.clone(),
            arch: info.arch.clone(),
        }
    }
}

// A fully built update image. Created only once every package of a source
// extracted cleanly; unlinked by the pool or janitor when no longer needed.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub backing_file: PathBuf,
    pub uri: String,
    pub packages: Vec<Package>,
}

// One remote or local update origin
pub struct UpdateSource {
    pub uri: String,
    pub origin: OriginKind,
    repo_handle: Option<RepoHandle>,
    // Resolved at most once per source instance
    packages: Option<Vec<PackageInfo>>,
    pub image_path: Option<PathBuf>,
}

impl UpdateSource {
    pub fn new(uri: &str, origin: OriginKind) -> Self {
        UpdateSource {
            uri: uri.to_string(),
            origin,
            repo_handle: None,
            packages: None,
            image_path: None,
        }
    }

    // Classify the URI without downloading content. Retrying is the
    // caller's decision.
    pub fn probe(&self, client: &dyn RepoClient) -> ProbeOutcome {
        client.probe(&self.uri)
    }

    fn ensure_repo(&mut self, client: &mut dyn RepoClient) -> Result<RepoHandle, UpdateError> {
        match self.repo_handle {
            Some(handle) => Ok(handle),
            None => {
                let handle = client.add_repository(&self.uri)?;
                self.repo_handle = Some(handle);
                Ok(handle)
            }
        }
    }

    // Newest version of each relevant package at this source. Identity is
    // (name, arch); add-on-only packages are excluded. Memoized.
    pub fn resolve_packages(
        &mut self,
        client: &mut dyn RepoClient,
    ) -> Result<&[PackageInfo], UpdateError> {
        if self.packages.is_none() {
            let handle = self.ensure_repo(client)?;
            let all = client.packages_of(handle)?;
            let kept = newest_only(all.into_iter().filter(|p| !is_addon(p)).collect());
            log_debug!("Resolved {} package(s) at {}", kept.len(), self.uri);
            self.packages = Some(kept);
        }

        Ok(self.packages.as_deref().unwrap_or_default())
    }

    // Download and extract every resolved package into one scratch tree,
    // prune it, and squash it into a single image. Any package-level
    // failure aborts the whole fetch and leaves no partial image behind.
    pub fn fetch(
        &mut self,
        client: &mut dyn RepoClient,
        runner: &dyn Runner,
        live_root: &Path,
        workdir: &Path,
        image_path: &Path,
    ) -> Result<FetchedImage, UpdateError> {
        let result = self.fetch_into(client, runner, live_root, workdir, image_path);
        if result.is_err() {
            let _ = fs::remove_dir_all(workdir);
            if image_path.exists() {
                let _ = fs::remove_file(image_path);
            }
            return result.map_err(|e| UpdateError::could_not_fetch(&self.uri, e));
        }
        self.image_path = Some(image_path.to_path_buf());
        result
    }

    fn fetch_into(
        &mut self,
        client: &mut dyn RepoClient,
        runner: &dyn Runner,
        live_root: &Path,
        workdir: &Path,
        image_path: &Path,
    ) -> Result<FetchedImage, UpdateError> {
        let packages = self.resolve_packages(client)?.to_vec();
        let handle = self.ensure_repo(client)?;
        fs::create_dir_all(workdir)?;

        let extractor = ArchiveExtractor::new(runner);
        for package in &packages {
            let archive = tempfile::Builder::new()
                .prefix(&format!("{}-", package.name))
                .suffix(".rpm")
                .tempfile()?;
            client.download(handle, package, archive.path())?;
            extractor.extract(archive.path(), workdir)?;
            log_info!("Extracted {} {} from {}", package.name, package.version, self.uri);
        }

        prune_unchanged(workdir, live_root);
        prune_irrelevant(workdir);

        ImageBuilder::new(runner).build(workdir, image_path)?;

        Ok(FetchedImage {
            backing_file: image_path.to_path_buf(),
            uri: self.uri.clone(),
            packages: packages.iter().map(Package::from).collect(),
        })
    }

    // Mount the built image and splice its contents over the live root
    pub fn apply(
        &self,
        runner: &dyn Runner,
        mounts: &MountManager,
        image: &FetchedImage,
        mount_point: &Path,
        splice_tool: &str,
        live_root: &Path,
        package_index: &Path,
    ) -> Result<(), UpdateError> {
        apply_image(
            runner,
            mounts,
            image,
            mount_point,
            splice_tool,
            live_root,
            package_index,
        )
    }

    // Release the package-manager-side registration; idempotent
    pub fn cleanup(&mut self, client: &mut dyn RepoClient) {
        if let Some(handle) = self.repo_handle.take() {
            client.release(handle);
        }
    }
}

// Shared by self-update sources and legacy driver updates: mount, splice,
// record. Splice failure is fatal to this update only.
pub fn apply_image(
    runner: &dyn Runner,
    mounts: &MountManager,
    image: &FetchedImage,
    mount_point: &Path,
    splice_tool: &str,
    live_root: &Path,
    package_index: &Path,
) -> Result<(), UpdateError> {
    mounts.mount(&image.backing_file, mount_point)?;

    let mp = mount_point.display().to_string();
    let root = live_root.display().to_string();
    let output = runner
        .run(None, splice_tool, &[&mp, &root])
        .map_err(|reason| UpdateError::ApplyFailed {
            mount_point: mount_point.to_path_buf(),
            reason,
        })?;

    if !output.success() {
        return Err(UpdateError::ApplyFailed {
            mount_point: mount_point.to_path_buf(),
            reason: format!("exit status {}: {}", output.status, output.stderr.trim()),
        });
    }

    log_info!("Applied {} onto {}", image.backing_file.display(), root);
    record_applied_packages(package_index, &image.packages);
    Ok(())
}

// Append-only index of applied packages, for post-mortem debugging only
fn record_applied_packages(package_index: &Path, packages: &[Package]) {
    if packages.is_empty() {
        return;
    }
    if let Some(parent) = package_index.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let mut lines = String::new();
    for package in packages {
        lines.push_str(&package.index_line());
        lines.push('\n');
    }
    let _ = OpenOptions::new()
        .create(true)
        .append(true)
        .open(package_index)
        .and_then(|mut file| file.write_all(lines.as_bytes()));
}

fn is_addon(package: &PackageInfo) -> bool {
    package
        .provides
        .iter()
        .any(|p| ADDON_PROVIDES.iter().any(|marker| p.starts_with(marker)))
}

// Keep only the highest version per (name, arch)
fn newest_only(packages: Vec<PackageInfo>) -> Vec<PackageInfo> {
    let mut kept: Vec<PackageInfo> = Vec::new();

    for candidate in packages {
        match kept
            .iter_mut()
            .find(|p| p.name == candidate.name && p.arch == candidate.arch)
        {
            Some(existing) => {
                if version::is_older(&existing.version, &candidate.version) {
                    *existing = candidate;
                }
            }
            None => kept.push(candidate),
        }
    }

    kept
}

// Drop files that are byte-identical to what the live root already has.
// Purely an optimization: a comparison error keeps the file, since an
// unpruned image is larger but never wrong.
fn prune_unchanged(workdir: &Path, live_root: &Path) {
    let files: Vec<PathBuf> = WalkDir::new(workdir)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();

    for file in files {
        let Ok(relative) = file.strip_prefix(workdir) else {
            continue;
        };
        let live = live_root.join(relative);
        if !live.is_file() {
            continue;
        }
        let identical = match (fs::read(&file), fs::read(&live)) {
            (Ok(ours), Ok(theirs)) => ours == theirs,
            _ => false,
        };
        if identical {
            let _ = fs::remove_file(&file);
        }
    }
}

fn prune_irrelevant(workdir: &Path) {
    for subtree in IRRELEVANT_SUBTREES {
        let path = workdir.join(subtree);
        if path.exists() {
            let _ = fs::remove_dir_all(&path);
        }
    }
}
