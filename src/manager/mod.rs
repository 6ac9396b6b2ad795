//! Package manager capability boundary.
//!
//! This module defines the unified interface the repair engine consumes,
//! independent of packaging ecosystem. A concrete binding (APT today,
//! anything else tomorrow) plugs in by implementing [`PackageManager`]; the
//! engine's logic never branches on ecosystem identity.

pub mod apt;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

use crate::bundle::{NameVersion, Package};

/// Verdict of a simulated installation.
///
/// Any manager-specific detail is collapsed into this set at the boundary;
/// these are the only outcomes the repair engine reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallVerdict {
    Ok,
    AlreadyInstalled,
    UnmetDependencies,
    NewerAlreadyInstalled,
    CannotFindPackage,
    UnknownProblem,
}

/// Outcome of a dry-run install check.
#[derive(Debug, Clone)]
pub struct InstallResult {
    pub verdict: InstallVerdict,
    /// Identity of the package the check ran against.
    pub package: Option<NameVersion>,
    /// Populated only when the verdict is
    /// [`InstallVerdict::UnmetDependencies`].
    pub unmet_dependencies: Vec<NameVersion>,
}

impl InstallResult {
    pub fn new(verdict: InstallVerdict, package: &Package) -> Self {
        InstallResult {
            verdict,
            package: Some(package.name_version.clone()),
            unmet_dependencies: Vec::new(),
        }
    }
}

/// The package manager tool could not be invoked at all (process launch
/// failure, broken environment). Always fatal to the current repair
/// attempt; never retried.
#[derive(Debug)]
pub struct ExecutionError {
    pub command: String,
    pub source: std::io::Error,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot launch \"{}\": {}", self.command, self.source)
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// A package file or directory name does not follow the ecosystem's naming
/// convention.
#[derive(Debug)]
pub struct ParseError {
    pub input: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot parse a package name and version from \"{}\"",
            self.input
        )
    }
}

impl std::error::Error for ParseError {}

/// One packaging ecosystem plugged into the repair engine.
///
/// The async operations are the engine's only suspension points; they may
/// block on process execution or network I/O. Deadlines and cancellation,
/// where needed, are the implementation's responsibility and surface as
/// ordinary errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Ecosystem label used for logging and selection.
    fn name(&self) -> &str;

    /// Derive a package identity from a file name.
    fn parse_name_version(&self, file_name: &str) -> Result<NameVersion>;

    /// Whether `file_name` is the main artifact of the package directory
    /// `dir_name`, as opposed to a co-located dependency artifact.
    fn is_main(&self, dir_name: &str, file_name: &str) -> bool;

    /// Dry-run install of `package` and everything staged with it against
    /// the current system state, without making changes.
    ///
    /// A non-zero exit of the underlying tool is not an error; it is
    /// encoded in the returned verdict. Only a failure to invoke the tool
    /// at all yields an [`ExecutionError`].
    async fn check_install(&self, package: &Package) -> Result<InstallResult>;

    /// The same dry run, but against the newest version available,
    /// ignoring any specific version the bundle holds.
    async fn check_install_latest(&self, name: &str) -> Result<InstallVerdict>;

    /// Resolve and materialize a concrete dependency set for `package` as
    /// of now, appending it to `package.dependencies`. Either all newly
    /// found dependencies are appended or none.
    async fn update_dependencies(&self, package: &mut Package) -> Result<()>;

    /// Fetch the newest installable version of `name` plus its
    /// dependencies as a brand-new package. Existing packages are never
    /// mutated.
    async fn download_latest_version(&self, name: &str) -> Result<Package>;

    /// Release manager-held scratch resources. Idempotent.
    async fn clean(&self) -> Result<()>;
}
