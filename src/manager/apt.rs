//! Debian/APT binding of the package manager capability.
//!
//! Shells out to `apt-get` for simulation and downloads, classifies its
//! textual output into [`InstallVerdict`]s, and stages package payloads in
//! a scratch directory released by [`PackageManager::clean`].

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use tempfile::TempDir;
use tokio::process::Command;

use crate::bundle::{self, NameVersion, Package};
use crate::manager::{
    ExecutionError, InstallResult, InstallVerdict, PackageManager, ParseError,
};

/// Where `apt-get install -d` leaves the archives it fetched.
const APT_CACHE_PATH: &str = "/var/cache/apt/archives";

pub struct AptManager {
    scratch: Mutex<Option<TempDir>>,
    seq: AtomicU64,
}

impl AptManager {
    pub fn new() -> Result<Self> {
        let scratch = TempDir::with_prefix("bundlefix-apt-")
            .context("cannot create a scratch directory for the APT package manager")?;
        Ok(AptManager {
            scratch: Mutex::new(Some(scratch)),
            seq: AtomicU64::new(0),
        })
    }

    /// A fresh uniquely-named directory under the manager's scratch root.
    /// Contents stay alive until [`PackageManager::clean`] runs, so package
    /// payloads staged here may be referenced by later operations.
    fn scratch_subdir(&self, label: &str) -> Result<PathBuf> {
        let guard = self.scratch.lock().unwrap();
        let root = guard
            .as_ref()
            .context("APT manager scratch space has already been released")?
            .path()
            .to_path_buf();
        drop(guard);
        let dir = root.join(format!("{}-{}", label, self.seq.fetch_add(1, Ordering::Relaxed)));
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create scratch directory {}", dir.display()))?;
        Ok(dir)
    }

    async fn run_shell(&self, command: &str) -> Result<Output> {
        debug!("running: {command}");
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|source| {
                ExecutionError {
                    command: command.to_string(),
                    source,
                }
                .into()
            })
    }
}

#[async_trait]
impl PackageManager for AptManager {
    fn name(&self) -> &str {
        "apt"
    }

    fn parse_name_version(&self, file_name: &str) -> Result<NameVersion> {
        // Bundle directories may use "=" as the name/version separator.
        let normalized = file_name.replace('=', "_");
        let mut parts = normalized.split('_');
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(ParseError {
                input: file_name.to_string(),
            }
            .into());
        }
        let version = parts.next().unwrap_or_default();
        Ok(NameVersion::new(name, version))
    }

    fn is_main(&self, dir_name: &str, file_name: &str) -> bool {
        let dir_name = dir_name.replace('=', "_");
        file_name.starts_with(&dir_name)
    }

    async fn check_install(&self, package: &Package) -> Result<InstallResult> {
        let staging = self.scratch_subdir(&format!(
            "check-install-{}-{}",
            package.name(),
            package.version()
        ))?;
        stage_payload(package, &staging)?;
        let output = self
            .run_shell(&format!("apt-get -s install -y {}/*", staging.display()))
            .await?;
        let mut result = InstallResult::new(InstallVerdict::Ok, package);
        if output.status.success() {
            return Ok(result);
        }
        let msg = combined_output(&output);
        result.verdict = classify_output(&msg);
        if result.verdict == InstallVerdict::UnmetDependencies {
            result.unmet_dependencies = parse_unmet_dependencies(&msg);
        }
        debug!(
            "apt-get simulation for {} reported {:?}",
            package.name(),
            result.verdict
        );
        Ok(result)
    }

    async fn check_install_latest(&self, name: &str) -> Result<InstallVerdict> {
        let output = self
            .run_shell(&format!("apt-get -s install -y {name}"))
            .await?;
        if output.status.success() {
            return Ok(InstallVerdict::Ok);
        }
        Ok(classify_output(&combined_output(&output)))
    }

    async fn update_dependencies(&self, package: &mut Package) -> Result<()> {
        clear_apt_cache()?;
        let staging = self.scratch_subdir(&format!(
            "update-dependencies-{}-{}",
            package.name(),
            package.version()
        ))?;
        stage_payload(package, &staging)?;
        let output = self
            .run_shell(&format!(
                "apt-get install -d -y --reinstall {}/*",
                staging.display()
            ))
            .await?;
        if !output.status.success() {
            bail!(
                "cannot download dependencies of {} with apt-get install -d; command output:\n{}",
                package.name(),
                combined_output(&output)
            );
        }
        // apt-get left everything it fetched in its archive cache. Keep the
        // payloads in scratch space and load the whole set before touching
        // the package, so a failure appends nothing.
        let harvest = staging.join("downloaded-dependencies");
        fs::create_dir(&harvest)
            .with_context(|| format!("cannot create directory {}", harvest.display()))?;
        copy_debs_from_cache(&harvest)?;
        let mut found = Vec::new();
        for path in sorted_deb_files(&harvest)? {
            let dep = bundle::load_package(&path, self)
                .with_context(|| format!("cannot load downloaded package {}", path.display()))?;
            found.push(std::sync::Arc::new(dep));
        }
        debug!(
            "apt-get fetched {} dependency package(s) for {}",
            found.len(),
            package.name()
        );
        package.dependencies.extend(found);
        Ok(())
    }

    async fn download_latest_version(&self, name: &str) -> Result<Package> {
        clear_apt_cache()?;
        let output = self
            .run_shell(&format!("apt-get install -d -y --reinstall {name}"))
            .await?;
        if !output.status.success() {
            bail!(
                "cannot download package {} with apt-get install -d; command output:\n{}",
                name,
                combined_output(&output)
            );
        }
        let staging = self.scratch_subdir(&format!("download-latest-{name}"))?;
        // The directory carries the bare package name, so the loaded
        // package comes back with its version not marked essential.
        let package_dir = staging.join(name);
        fs::create_dir(&package_dir)
            .with_context(|| format!("cannot create package directory {}", package_dir.display()))?;
        copy_debs_from_cache(&package_dir)?;
        bundle::load_package(&package_dir, self)
            .with_context(|| format!("cannot load downloaded package {name}"))
    }

    async fn clean(&self) -> Result<()> {
        let scratch = self.scratch.lock().unwrap().take();
        if let Some(dir) = scratch {
            dir.close()
                .context("cannot remove the APT manager scratch directory")?;
        }
        Ok(())
    }
}

/// Copy a package's payload, and recursively its dependencies' payloads,
/// into one flat staging directory for apt-get to consume as a group.
fn stage_payload(package: &Package, dir: &Path) -> Result<()> {
    let file_name = package.location.file_name().with_context(|| {
        format!(
            "package {} has no payload file name ({})",
            package.name(),
            package.location.display()
        )
    })?;
    fs::copy(&package.location, dir.join(file_name)).with_context(|| {
        format!(
            "cannot copy package payload {} to {}",
            package.location.display(),
            dir.display()
        )
    })?;
    for dep in &package.dependencies {
        stage_payload(dep, dir)?;
    }
    Ok(())
}

fn combined_output(output: &Output) -> String {
    let mut msg = String::from_utf8_lossy(&output.stdout).into_owned();
    msg.push_str(&String::from_utf8_lossy(&output.stderr));
    msg
}

fn classify_output(msg: &str) -> InstallVerdict {
    let msg = msg.to_lowercase();
    if msg.contains("will be downgraded") {
        InstallVerdict::NewerAlreadyInstalled
    } else if msg.contains("unmet dependencies") {
        InstallVerdict::UnmetDependencies
    } else if msg.contains("unable to locate package") {
        InstallVerdict::CannotFindPackage
    } else if msg.contains("is already the newest version") {
        InstallVerdict::AlreadyInstalled
    } else {
        InstallVerdict::UnknownProblem
    }
}

fn dep_regex() -> &'static Regex {
    static DEP_RE: OnceLock<Regex> = OnceLock::new();
    DEP_RE.get_or_init(|| {
        Regex::new(r"Depends:\s*(\S+)(?:\s+\(>=\s*([^)\s]+)\))?").expect("dependency regex")
    })
}

fn parse_unmet_dependencies(msg: &str) -> Vec<NameVersion> {
    dep_regex()
        .captures_iter(msg)
        .map(|caps| NameVersion {
            name: caps[1].to_string(),
            version: caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
        .collect()
}

/// Remove leftover archives so the cache only ever holds what the next
/// `apt-get install -d` fetches.
fn clear_apt_cache() -> Result<()> {
    let entries = match fs::read_dir(APT_CACHE_PATH) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("cannot read {APT_CACHE_PATH}"));
        }
    };
    for entry in entries {
        let path = entry
            .with_context(|| format!("cannot read {APT_CACHE_PATH}"))?
            .path();
        if path.extension().is_some_and(|ext| ext == "deb") && path.is_file() {
            fs::remove_file(&path)
                .with_context(|| format!("cannot remove {}", path.display()))?;
        }
    }
    Ok(())
}

fn copy_debs_from_cache(dest: &Path) -> Result<()> {
    let entries =
        fs::read_dir(APT_CACHE_PATH).with_context(|| format!("cannot read {APT_CACHE_PATH}"))?;
    for entry in entries {
        let path = entry
            .with_context(|| format!("cannot read {APT_CACHE_PATH}"))?
            .path();
        if !path.extension().is_some_and(|ext| ext == "deb") || !path.is_file() {
            continue;
        }
        let file_name = path.file_name().unwrap_or_default();
        fs::copy(&path, dest.join(file_name)).with_context(|| {
            format!("cannot copy {} to {}", path.display(), dest.display())
        })?;
    }
    Ok(())
}

fn sorted_deb_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("cannot read directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    Ok(files)
}
