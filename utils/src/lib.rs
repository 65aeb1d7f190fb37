use std::{fs::DirBuilder, path::PathBuf};

use nix::unistd;

pub mod logging;

pub fn get_state_dir() -> Result<PathBuf, String> {
    let path = PathBuf::from("/var/lib/instup");
    if !path.exists()
        && DirBuilder::new().recursive(true).create(&path).is_err()
    {
        Err(String::from("Failed to create instup state directory!"))
    } else {
        Ok(path)
    }
}

pub fn is_root() -> bool {
    unistd::geteuid().as_raw() == 0
}
