use std::env;
use std::path::{Path, PathBuf};
use std::process::exit;

use utils::{log_error, log_info, log_warning};

use instup::config::{OriginKind, UpdateConfig};
use instup::janitor::{OverlayJanitor, OverlayState};
use instup::mounts::MountManager;
use instup::pool::{self, UpdatePool};
use instup::repo::HttpRepoClient;
use instup::runner::SystemRunner;

// The verbs the orchestrating installer drives this subsystem with
enum Cmd {
    Fetch { sources: Vec<String>, drivers: Vec<String> },
    Apply,
    Cleanup,
    Teardown { mount_root: PathBuf },
}

fn usage() -> ! {
    eprintln!("usage: instup [--config <path>] <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  fetch [uri...] [--driver <uri>]   fetch updates into the update dir");
    eprintln!("  apply                             mount and splice fetched images");
    eprintln!("  cleanup                           reclaim orphaned overlay mounts");
    eprintln!("  teardown [mount-root]             unmount the target tree (default /mnt)");
    exit(2);
}

fn parse_args() -> (Option<PathBuf>, Cmd) {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut config_path = None;
    let mut rest = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            match iter.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => usage(),
            }
        } else {
            rest.push(arg);
        }
    }

    let Some(verb) = rest.first() else { usage() };
    let cmd = match verb.as_str() {
        "fetch" => {
            let mut sources = Vec::new();
            let mut drivers = Vec::new();
            let mut iter = rest[1..].iter();
            while let Some(arg) = iter.next() {
                if arg == "--driver" {
                    match iter.next() {
                        Some(uri) => drivers.push(uri.clone()),
                        None => usage(),
                    }
                } else {
                    sources.push(arg.clone());
                }
            }
            Cmd::Fetch { sources, drivers }
        }
        "apply" => Cmd::Apply,
        "cleanup" => Cmd::Cleanup,
        "teardown" => Cmd::Teardown {
            mount_root: rest
                .get(1)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/mnt")),
        },
        _ => usage(),
    };

    (config_path, cmd)
}

fn main() {
    utils::logging::init_logger();
    let (config_path, cmd) = parse_args();

    if !utils::is_root() {
        eprintln!("instup must run as root");
        exit(1);
    }

    // Registry and package-index writers expect the state dir to exist
    if let Err(e) = utils::get_state_dir() {
        log_warning!("{}", e);
    }

    let config = match config_path {
        Some(path) => UpdateConfig::load_from(&path),
        None => UpdateConfig::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };

    let status = match cmd {
        Cmd::Fetch { sources, drivers } => run_fetch(config, sources, drivers),
        Cmd::Apply => run_apply(config),
        Cmd::Cleanup => run_cleanup(config),
        Cmd::Teardown { mount_root } => run_teardown(config, &mount_root),
    };
    exit(status);
}

fn run_fetch(config: UpdateConfig, sources: Vec<String>, drivers: Vec<String>) -> i32 {
    let runner = SystemRunner;
    let mut client = match HttpRepoClient::new() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let configured = config.sources.clone();
    let mut pool = match UpdatePool::new(config, &runner, &mut client) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    for entry in &configured {
        pool.add_source(&entry.uri, entry.origin);
    }
    for uri in &sources {
        pool.add_source(uri, OriginKind::User);
    }
    for uri in &drivers {
        pool.add(uri);
    }

    pool.fetch_all();

    let fetched = pool.fetched_images().len();
    println!("Fetched {} update(s)", fetched);
    for (uri, error) in pool.failures() {
        println!("Skipped {}: {}", uri, error);
    }

    pool.cleanup();
    if pool.failures().is_empty() { 0 } else { 1 }
}

fn run_apply(config: UpdateConfig) -> i32 {
    let runner = SystemRunner;
    match pool::apply_existing_images(&config, &runner) {
        Ok(applied) => {
            println!("Applied {} update image(s)", applied);
            0
        }
        Err(e) => {
            log_error!("Apply failed: {}", e);
            eprintln!("{}", e);
            1
        }
    }
}

fn run_cleanup(config: UpdateConfig) -> i32 {
    let runner = SystemRunner;
    let mounts = MountManager::with_paths(&runner, "/proc/mounts", &config.mount_registry);
    let janitor = OverlayJanitor::new(&runner, mounts);

    let overlays = match janitor.discover(Path::new(&config.mount_base)) {
        Ok(overlays) => overlays,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let classified = janitor.scan(Path::new(&config.live_root), overlays);
    let kept = classified
        .iter()
        .filter(|(_, state)| *state == OverlayState::Referenced)
        .count();
    let removed = janitor.reclaim(&classified);
    println!(
        "Reclaimed {} orphaned overlay(s), kept {} referenced",
        removed.len(),
        kept
    );
    0
}

fn run_teardown(config: UpdateConfig, mount_root: &Path) -> i32 {
    let runner = SystemRunner;
    let mounts = MountManager::with_paths(&runner, "/proc/mounts", &config.mount_registry);
    let janitor = OverlayJanitor::new(&runner, mounts);

    match janitor.final_teardown(mount_root) {
        Ok(report) if report.complete() => {
            log_info!("Teardown of {} complete", mount_root.display());
            println!("Unmounted {} filesystem(s)", report.unmounted.len());
            0
        }
        Ok(report) => {
            // Best effort: report the holders, let the caller decide
            println!(
                "Unmounted {} filesystem(s), {} still mounted:",
                report.unmounted.len(),
                report.leftover.len()
            );
            for leftover in &report.leftover {
                println!(
                    "  {} (held by: {})",
                    leftover.path.display(),
                    leftover.holders.join(", ")
                );
            }
            1
        }
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}
