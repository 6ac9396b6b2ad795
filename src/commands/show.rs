use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use tempfile::TempDir;

use crate::archive;
use crate::bundle::{self, Package};
use crate::manager::PackageManager;

/// Print the dependency tree of the bundle at `tarball`.
pub fn show<M: PackageManager>(manager: &M, tarball: &Path) -> Result<()> {
    let unpack_dir = TempDir::with_prefix("bundlefix-unpack-")
        .context("cannot create a directory to unpack the bundle into")?;
    archive::unpack_bundle(tarball, unpack_dir.path())?;
    let bundle = bundle::load_bundle(unpack_dir.path(), manager)?;
    for package in &bundle.packages {
        print!("{}", render_tree(package));
    }
    Ok(())
}

/// Render one package subtree, two-space indented per level, marking
/// packages whose exact version must be preserved.
pub fn render_tree(package: &Package) -> String {
    let mut out = String::new();
    render_into(package, 0, &mut out);
    out
}

fn render_into(package: &Package, depth: usize, out: &mut String) {
    let _ = write!(out, "{}{}", "  ".repeat(depth), package.name());
    if !package.version().is_empty() {
        let _ = write!(out, " {}", package.version());
    }
    if package.version_essential {
        let _ = write!(out, " [essential]");
    }
    out.push('\n');
    for dep in &package.dependencies {
        render_into(dep, depth + 1, out);
    }
}
