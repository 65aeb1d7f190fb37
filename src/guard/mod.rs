use crate::error::UpdateError;
use crate::runner::Runner;
use crate::source::Package;
use crate::version;

// Anti-downgrade check over a fixed allow-list of version-critical package
// names. Rolling the installer's own tooling back mid-run risks
// incompatible on-disk state, so those packages must stay monotonic across
// self-updates; everything else may legitimately vary and is never compared.
pub struct DowngradeGuard {
    guarded: Vec<String>,
}

// Derived per check, never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DowngradeVerdict {
    pub safe: bool,
    pub offending_packages: Vec<Package>,
}

impl DowngradeGuard {
    pub fn new(guarded: Vec<String>) -> Self {
        DowngradeGuard { guarded }
    }

    // Pure function of the two package lists; mutates neither
    pub fn check(&self, installed: &[Package], offered: &[Package]) -> DowngradeVerdict {
        let mut offending_packages = Vec::new();

        for name in &self.guarded {
            let Some(current) = installed.iter().find(|p| &p.name == name) else {
                continue;
            };
            let Some(candidate) = offered.iter().find(|p| &p.name == name) else {
                continue;
            };
            if version::is_older(&candidate.version, &current.version) {
                offending_packages.push(candidate.clone());
            }
        }

        DowngradeVerdict {
            safe: offending_packages.is_empty(),
            offending_packages,
        }
    }
}

// Versions already active in the installation environment, one query per
// guarded name. A name that is not installed is simply not compared.
pub fn installed_packages(
    runner: &dyn Runner,
    names: &[String],
) -> Result<Vec<Package>, UpdateError> {
    let mut packages = Vec::new();

    for name in names {
        let output = runner
            .run(
                None,
                "rpm",
                &["-q", "--queryformat", "%{NAME} %{VERSION}-%{RELEASE} %{ARCH}", name],
            )
            .map_err(|reason| UpdateError::Repository {
                uri: "rpmdb".to_string(),
                reason,
            })?;

        if !output.success() {
            continue;
        }

        let mut fields = output.stdout.split_whitespace();
        if let (Some(name), Some(version), Some(arch)) =
            (fields.next(), fields.next(), fields.next())
        {
            packages.push(Package {
                name: name.to_string(),
                version: version.to_string(),
                arch: arch.to_string(),
            });
        }
    }

    Ok(packages)
}
