use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

const CONFIG_PATH: &str = "/etc/instup/config.yaml";

// One candidate update origin, as resolved by the boot/registration layer
#[derive(PartialEq, Serialize, Deserialize, Debug, Clone)]
pub struct SourceSpec {
    pub uri: String,
    #[serde(default)]
    pub origin: OriginKind,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum OriginKind {
    #[default]
    Default,
    User,
}

#[derive(PartialEq, Serialize, Deserialize, Debug, Clone)]
pub struct UpdateConfig {
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    #[serde(default = "default_update_dir")]
    pub update_dir: String,
    #[serde(default = "default_mount_base")]
    pub mount_base: String,
    #[serde(default = "default_live_root")]
    pub live_root: String,
    #[serde(default = "default_guarded_packages")]
    pub guarded_packages: Vec<String>,
    #[serde(default = "default_splice_tool")]
    pub splice_tool: String,
    #[serde(default = "default_mount_registry")]
    pub mount_registry: String,
    #[serde(default = "default_package_index")]
    pub package_index: String,
}

fn default_update_dir() -> String {
    "/download".to_string()
}

fn default_mount_base() -> String {
    "/mounts".to_string()
}

fn default_live_root() -> String {
    "/".to_string()
}

fn default_guarded_packages() -> Vec<String> {
    // Only the installer's own core tooling must stay monotonic across
    // self-updates; everything else may legitimately vary.
    vec![
        "instup-core".to_string(),
        "instup-frontend".to_string(),
        "libinstup".to_string(),
    ]
}

fn default_splice_tool() -> String {
    "adddir".to_string()
}

fn default_mount_registry() -> String {
    "/var/lib/instup/mounted_images".to_string()
}

fn default_package_index() -> String {
    "/var/lib/instup/applied_packages".to_string()
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            sources: Vec::new(),
            update_dir: default_update_dir(),
            mount_base: default_mount_base(),
            live_root: default_live_root(),
            guarded_packages: default_guarded_packages(),
            splice_tool: default_splice_tool(),
            mount_registry: default_mount_registry(),
            package_index: default_package_index(),
        }
    }
}

impl UpdateConfig {
    pub fn load() -> Result<Self, String> {
        Self::load_from(Path::new(CONFIG_PATH))
    }

    // Missing config file means defaults; a present but unparseable file is
    // an error rather than a silent fallback
    pub fn load_from(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(UpdateConfig::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        serde_yaml::from_str(&contents).map_err(|e| format!("Failed to parse config file: {}", e))
    }
}
