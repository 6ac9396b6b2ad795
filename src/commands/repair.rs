use anyhow::{Context, Result, bail};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use crate::archive;
use crate::bundle;
use crate::fix::FixEngine;
use crate::manager::PackageManager;

/// Repair every top-level package of the bundle at `tarball` and write the
/// result to `output`.
///
/// The full repair log is printed per package, in order, as the audit trail
/// for the operator. The repaired bundle is written even when some packages
/// stay broken; the error returned in that case lists them.
#[tracing::instrument(skip(manager, tarball, output))]
pub async fn repair<M: PackageManager>(
    manager: &M,
    tarball: &Path,
    output: &Path,
    attempts: u32,
) -> Result<()> {
    let unpack_dir = TempDir::with_prefix("bundlefix-unpack-")
        .context("cannot create a directory to unpack the bundle into")?;
    archive::unpack_bundle(tarball, unpack_dir.path())?;
    let mut bundle = bundle::load_bundle(unpack_dir.path(), manager)?;
    info!(
        "loaded {} package(s) from {} using the {} package manager",
        bundle.packages.len(),
        tarball.display(),
        manager.name()
    );

    let engine = FixEngine::with_attempts(manager, attempts);
    let mut broken = Vec::new();
    for i in 0..bundle.packages.len() {
        // Work on an owned copy; the bundle entry is only superseded once
        // the repair comes back successful.
        let mut target = (*bundle.packages[i]).clone();
        let result = engine.repair(&mut target, &bundle).await;
        for line in &result.log {
            println!("{line}");
        }
        println!();
        if result.success {
            let fixed = result.package.unwrap_or(target);
            bundle.packages[i] = Arc::new(fixed);
        } else {
            broken.push(target.name().to_string());
        }
    }

    // Pack before cleaning: replacement payloads live in the manager's
    // scratch space.
    archive::pack_bundle(&bundle, output)?;
    info!("repaired bundle written to {}", output.display());
    if let Err(err) = manager.clean().await {
        warn!("could not release package manager scratch space: {err:#}");
    }
    if !broken.is_empty() {
        bail!(
            "{} package(s) could not be made installable: {}",
            broken.len(),
            broken.join(", ")
        );
    }
    Ok(())
}
