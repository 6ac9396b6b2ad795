//! Builds the [`Bundle`] graph from an unpacked bundle directory.
//!
//! Layout convention: one subdirectory per top-level package, holding the
//! package's main artifact plus its co-located dependency artifacts. Which
//! file is the main artifact, and how names map to identities, is the
//! package manager's call.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::bundle::{Bundle, Package};
use crate::manager::PackageManager;

/// Build a [`Bundle`] from an unpacked bundle directory. Entries that are
/// not directories are ignored at the top level.
pub fn load_bundle<M: PackageManager>(root: &Path, manager: &M) -> Result<Bundle> {
    let mut entries: Vec<_> = fs::read_dir(root)
        .with_context(|| format!("cannot read bundle directory {}", root.display()))?
        .collect::<Result<_, _>>()
        .with_context(|| format!("cannot read bundle directory {}", root.display()))?;
    entries.sort_by_key(|e| e.file_name());

    let mut packages = Vec::new();
    for entry in entries {
        if !entry.path().is_dir() {
            continue;
        }
        let package = load_package_dir(&entry.path(), manager).with_context(|| {
            format!(
                "cannot create package from directory {}",
                entry.path().display()
            )
        })?;
        packages.push(Arc::new(package));
    }
    Ok(Bundle { packages })
}

/// Load a single package from `path`: a directory becomes a package with
/// its co-located dependencies, a plain file a dependency-less package.
pub fn load_package<M: PackageManager>(path: &Path, manager: &M) -> Result<Package> {
    let meta = fs::metadata(path)
        .with_context(|| format!("cannot stat {} to open package", path.display()))?;
    if meta.is_dir() {
        load_package_dir(path, manager)
    } else {
        load_package_file(path, manager)
    }
}

fn load_package_file<M: PackageManager>(path: &Path, manager: &M) -> Result<Package> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("package path {} has no file name", path.display()))?;
    let name_version = manager
        .parse_name_version(file_name)
        .with_context(|| format!("cannot parse package name and version of {file_name}"))?;
    Ok(Package::new(name_version, path.to_path_buf()))
}

fn load_package_dir<M: PackageManager>(dir: &Path, manager: &M) -> Result<Package> {
    let dir_name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("package directory {} has no name", dir.display()))?;
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("cannot list package directory {}", dir.display()))?
        .collect::<Result<_, _>>()
        .with_context(|| format!("cannot list package directory {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    let mut main_package: Option<Package> = None;
    let mut dependencies = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            // Nested directories are not part of the convention.
            continue;
        }
        let package = load_package_file(&path, manager)?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if manager.is_main(dir_name, &file_name) {
            if main_package.is_some() {
                bail!("more than one candidate for the main package in {dir_name}");
            }
            let dir_identity = manager.parse_name_version(dir_name).with_context(|| {
                format!("cannot detect whether the version of {dir_name} is essential")
            })?;
            let mut package = package;
            // A directory name without a version means any version will do.
            package.version_essential = !dir_identity.version.is_empty();
            main_package = Some(package);
        } else {
            dependencies.push(Arc::new(package));
        }
    }

    let mut main_package =
        main_package.with_context(|| format!("no candidate for the main package in {dir_name}"))?;
    main_package.dependencies = dependencies;
    Ok(main_package)
}
