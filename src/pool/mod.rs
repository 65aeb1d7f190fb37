use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use utils::{log_info, log_warning};

use crate::config::{OriginKind, UpdateConfig};
use crate::error::UpdateError;
use crate::extract::ArchiveExtractor;
use crate::guard::{self, DowngradeGuard};
use crate::image::ImageBuilder;
use crate::mounts::MountManager;
use crate::repo::{ProbeOutcome, RepoClient, download_file};
use crate::runner::Runner;
use crate::source::{FetchedImage, Package, UpdateSource, apply_image};

pub const IMAGE_SLOT_PREFIX: &str = "update_";
pub const IMAGE_SLOT_WIDTH: usize = 3;
pub const MOUNT_SLOT_PREFIX: &str = "mp_";
pub const MOUNT_SLOT_WIDTH: usize = 4;

// Next free slot name under `base_dir`. Derived from the count of existing
// matching entries rather than max+1, then bumped just past collisions, so
// the number survives process restarts and is never reused while a sibling
// with that suffix is still on disk. After out-of-order external cleanup
// the numbering is collision-free but not monotonic.
pub fn next_slot(base_dir: &Path, prefix: &str, width: usize) -> Result<String, UpdateError> {
    fs::create_dir_all(base_dir)?;

    let mut existing = Vec::new();
    for entry in fs::read_dir(base_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(rest) = name.strip_prefix(prefix)
            && !rest.is_empty()
            && rest.chars().all(|c| c.is_ascii_digit())
        {
            existing.push(name);
        }
    }

    let mut index = existing.len();
    loop {
        let candidate = format!("{}{:0width$}", prefix, index, width = width);
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
        index += 1;
    }
}

enum Unit {
    SelfUpdate(UpdateSource),
    DriverUpdate { uri: String },
}

struct UnitState {
    unit: Unit,
    image: Option<FetchedImage>,
}

// Ordered collection of updates. Fetches and applies strictly in the order
// units were added; later updates may overwrite files from earlier ones
// (last-write-wins is the apply contract, distinct from the monotonic
// DowngradeGuard check at fetch admission time).
pub struct UpdatePool<'a> {
    config: UpdateConfig,
    runner: &'a dyn Runner,
    client: &'a mut dyn RepoClient,
    http: Client,
    units: Vec<UnitState>,
    failures: Vec<(String, UpdateError)>,
    // Queried once per fetch pass
    installed: Option<Vec<Package>>,
}

impl<'a> UpdatePool<'a> {
    pub fn new(
        config: UpdateConfig,
        runner: &'a dyn Runner,
        client: &'a mut dyn RepoClient,
    ) -> Result<Self, String> {
        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(UpdatePool {
            config,
            runner,
            client,
            http,
            units: Vec::new(),
            failures: Vec::new(),
            installed: None,
        })
    }

    // Register a self-update source; fetched later by fetch_all
    pub fn add_source(&mut self, uri: &str, origin: OriginKind) {
        self.units.push(UnitState {
            unit: Unit::SelfUpdate(UpdateSource::new(uri, origin)),
            image: None,
        });
    }

    // Register a legacy single-archive driver update. The unit is fetched
    // immediately; on failure it is not registered and false is returned.
    pub fn add(&mut self, uri: &str) -> bool {
        match self.fetch_driver_update(uri) {
            Ok(image) => {
                self.units.push(UnitState {
                    unit: Unit::DriverUpdate {
                        uri: uri.to_string(),
                    },
                    image: Some(image),
                });
                true
            }
            Err(e) => {
                log_warning!("Driver update {} skipped: {}", uri, e);
                self.failures.push((uri.to_string(), e));
                false
            }
        }
    }

    fn fetch_driver_update(&self, uri: &str) -> Result<FetchedImage, UpdateError> {
        self.fetch_driver_update_inner(uri)
            .map_err(|e| UpdateError::could_not_fetch(uri, e))
    }

    fn fetch_driver_update_inner(&self, uri: &str) -> Result<FetchedImage, UpdateError> {
        let update_dir = Path::new(&self.config.update_dir);
        let slot = next_slot(update_dir, IMAGE_SLOT_PREFIX, IMAGE_SLOT_WIDTH)?;
        let image_path = update_dir.join(&slot);

        let suffix = Path::new(uri)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_else(|| ".dud".to_string());
        let archive = tempfile::Builder::new()
            .prefix("driver-")
            .suffix(&suffix)
            .tempfile()?;
        download_file(&self.http, uri, archive.path())?;

        // Scratch tree is discarded with the tempdir on any failure
        let workdir = tempfile::Builder::new()
            .prefix("work_")
            .tempdir_in(update_dir)?;
        ArchiveExtractor::new(self.runner).extract(archive.path(), workdir.path())?;
        ImageBuilder::new(self.runner).build(workdir.path(), &image_path)?;

        log_info!("Fetched driver update {} into {}", uri, image_path.display());
        Ok(FetchedImage {
            backing_file: image_path,
            uri: uri.to_string(),
            packages: Vec::new(),
        })
    }

    // Sequentially fetch every pending unit. One unit's failure is recorded
    // for the caller to report and does not abort the rest.
    pub fn fetch_all(&mut self) {
        let update_dir = PathBuf::from(&self.config.update_dir);
        let guard = DowngradeGuard::new(self.config.guarded_packages.clone());

        for i in 0..self.units.len() {
            if self.units[i].image.is_some() {
                continue;
            }
            let Unit::SelfUpdate(ref mut source) = self.units[i].unit else {
                continue;
            };
            let uri = source.uri.clone();

            match fetch_one(
                source,
                self.client,
                self.runner,
                &guard,
                &mut self.installed,
                &self.config,
                &update_dir,
            ) {
                Ok(image) => self.units[i].image = Some(image),
                Err(e) => {
                    log_warning!("Update source {} skipped: {}", uri, e);
                    self.failures.push((uri, e));
                }
            }
        }
    }

    // Apply every fetched unit in the order it was added. A failed apply is
    // fatal to that unit only.
    pub fn apply_all(&mut self) {
        let mounts = MountManager::with_paths(
            self.runner,
            "/proc/mounts",
            &self.config.mount_registry,
        );
        let mount_base = PathBuf::from(&self.config.mount_base);
        let live_root = PathBuf::from(&self.config.live_root);
        let package_index = PathBuf::from(&self.config.package_index);

        for state in &self.units {
            let Some(image) = &state.image else {
                continue;
            };

            let applied = next_slot(&mount_base, MOUNT_SLOT_PREFIX, MOUNT_SLOT_WIDTH)
                .map(|slot| mount_base.join(slot))
                .and_then(|mount_point| {
                    apply_image(
                        self.runner,
                        &mounts,
                        image,
                        &mount_point,
                        &self.config.splice_tool,
                        &live_root,
                        &package_index,
                    )
                });

            if let Err(e) = applied {
                log_warning!("Failed to apply {}: {}", image.uri, e);
                self.failures.push((image.uri.clone(), e));
            }
        }
    }

    // Release package-manager registrations; idempotent
    pub fn cleanup(&mut self) {
        for state in &mut self.units {
            if let Unit::SelfUpdate(ref mut source) = state.unit {
                source.cleanup(self.client);
            }
        }
    }

    pub fn failures(&self) -> &[(String, UpdateError)] {
        &self.failures
    }

    pub fn fetched_images(&self) -> Vec<&FetchedImage> {
        self.units.iter().filter_map(|u| u.image.as_ref()).collect()
    }
}

// Apply every image already sitting in the update dir, in slot order. Used
// when apply runs in a later process than fetch: the images on disk are the
// only state that survives, which is exactly why slots are allocated by
// scanning. Per-image failures are logged and skipped.
pub fn apply_existing_images(config: &UpdateConfig, runner: &dyn Runner) -> Result<usize, UpdateError> {
    let update_dir = Path::new(&config.update_dir);
    let mount_base = PathBuf::from(&config.mount_base);
    let live_root = PathBuf::from(&config.live_root);
    let package_index = PathBuf::from(&config.package_index);
    let mounts = MountManager::with_paths(runner, "/proc/mounts", &config.mount_registry);

    let mut slots = Vec::new();
    for entry in fs::read_dir(update_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(rest) = name.strip_prefix(IMAGE_SLOT_PREFIX)
            && !rest.is_empty()
            && rest.chars().all(|c| c.is_ascii_digit())
            && entry.path().is_file()
        {
            slots.push(name);
        }
    }
    slots.sort();

    let mut applied = 0;
    for slot in slots {
        let image = FetchedImage {
            backing_file: update_dir.join(&slot),
            uri: slot.clone(),
            packages: Vec::new(),
        };

        let result = next_slot(&mount_base, MOUNT_SLOT_PREFIX, MOUNT_SLOT_WIDTH)
            .map(|name| mount_base.join(name))
            .and_then(|mount_point| {
                apply_image(
                    runner,
                    &mounts,
                    &image,
                    &mount_point,
                    &config.splice_tool,
                    &live_root,
                    &package_index,
                )
            });

        match result {
            Ok(()) => applied += 1,
            Err(e) => log_warning!("Failed to apply {}: {}", slot, e),
        }
    }

    Ok(applied)
}

fn fetch_one(
    source: &mut UpdateSource,
    client: &mut dyn RepoClient,
    runner: &dyn Runner,
    guard: &DowngradeGuard,
    installed: &mut Option<Vec<Package>>,
    config: &UpdateConfig,
    update_dir: &Path,
) -> Result<FetchedImage, UpdateError> {
    match source.probe(client) {
        ProbeOutcome::Found => (),
        ProbeOutcome::NotFound => {
            return Err(UpdateError::could_not_fetch(
                &source.uri,
                UpdateError::NotFound(source.uri.clone()),
            ));
        }
        ProbeOutcome::Error(reason) => {
            return Err(UpdateError::could_not_fetch(
                &source.uri,
                UpdateError::Transport {
                    url: source.uri.clone(),
                    reason,
                },
            ));
        }
    }

    // Downgrade admission check before the source is trusted
    if !config.guarded_packages.is_empty() {
        let offered: Vec<Package> = match source.resolve_packages(client) {
            Ok(packages) => packages.iter().map(Package::from).collect(),
            // Aggregated like every other fetch-phase failure
            Err(e) => return Err(UpdateError::could_not_fetch(&source.uri, e)),
        };
        if installed.is_none() {
            *installed = Some(guard::installed_packages(
                runner,
                &config.guarded_packages,
            )?);
        }
        let verdict = guard.check(installed.as_deref().unwrap_or_default(), &offered);
        if !verdict.safe {
            return Err(UpdateError::DowngradeRejected {
                uri: source.uri.clone(),
                packages: verdict
                    .offending_packages
                    .iter()
                    .map(|p| format!("{}-{}", p.name, p.version))
                    .collect(),
            });
        }
    }

    let slot = next_slot(update_dir, IMAGE_SLOT_PREFIX, IMAGE_SLOT_WIDTH)?;
    let image_path = update_dir.join(&slot);
    let workdir = tempfile::Builder::new()
        .prefix("work_")
        .tempdir_in(update_dir)?;

    source.fetch(
        client,
        runner,
        Path::new(&config.live_root),
        workdir.path(),
        &image_path,
    )
}
