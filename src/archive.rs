//! Reading and writing bundle tarballs.
//!
//! A bundle travels as a gzipped tarball whose top level holds one
//! directory per package. Unpacking materializes that layout on disk for
//! the loader; packing writes a repaired [`Bundle`] back out with each
//! package's dependencies co-located in its directory.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::Path;
use tar::{Archive, Builder};

use crate::bundle::{Bundle, Package};

/// Unpack a gzipped bundle tarball into `dest`.
pub fn unpack_bundle(tarball: &Path, dest: &Path) -> Result<()> {
    let file = File::open(tarball)
        .with_context(|| format!("cannot open bundle {}", tarball.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest)
        .with_context(|| format!("cannot unpack bundle {}", tarball.display()))?;
    Ok(())
}

/// Pack a bundle into a gzipped tarball at `out`.
///
/// Each top-level package is stored as `<dir>/<file>` with its dependency
/// payloads alongside it, regardless of where the payloads currently live
/// on disk; a downloaded replacement package lands in the archive exactly
/// like a package that was in the bundle all along.
pub fn pack_bundle(bundle: &Bundle, out: &Path) -> Result<()> {
    let file = File::create(out)
        .with_context(|| format!("cannot create bundle file {}", out.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    for package in &bundle.packages {
        append_package(&mut builder, package)?;
    }
    let encoder = builder
        .into_inner()
        .context("cannot finish writing the bundle tarball")?;
    encoder
        .finish()
        .context("cannot finish compressing the bundle tarball")?;
    Ok(())
}

fn append_package(builder: &mut Builder<GzEncoder<File>>, package: &Package) -> Result<()> {
    let dir_name = package_dir_name(package);
    append_payload(builder, package, &dir_name)?;
    for dep in &package.dependencies {
        append_payload(builder, dep, &dir_name)?;
    }
    Ok(())
}

fn append_payload(
    builder: &mut Builder<GzEncoder<File>>,
    package: &Package,
    dir_name: &str,
) -> Result<()> {
    let file_name = package.location.file_name().with_context(|| {
        format!(
            "package {} has no payload file name ({})",
            package.name(),
            package.location.display()
        )
    })?;
    let entry = Path::new(dir_name).join(file_name);
    builder
        .append_path_with_name(&package.location, &entry)
        .with_context(|| {
            format!(
                "cannot add {} to the bundle as {}",
                package.location.display(),
                entry.display()
            )
        })?;
    Ok(())
}

/// The directory a package's artifacts are archived under: the directory
/// its payload currently sits in, falling back to the package name for
/// payloads that sit at a root.
fn package_dir_name(package: &Package) -> String {
    package
        .location
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| package.name().to_string())
}
