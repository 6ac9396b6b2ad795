//! Bundle data model.
//!
//! A bundle is the full local universe of packages available for offline
//! repair: one top-level package per directory of the unpacked tarball, each
//! carrying its own dependency subtree. Dependency packages may be shared
//! between parents, so subtrees hang off reference-counted handles.

mod loader;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub use loader::{load_bundle, load_package};

/// Package identity: a name plus an optional exact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NameVersion {
    pub name: String,
    /// Empty means any version is acceptable.
    pub version: String,
}

impl NameVersion {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        NameVersion {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for NameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} (>= {})", self.name, self.version)
        }
    }
}

/// One installable unit plus its declared dependencies.
#[derive(Debug, Clone)]
pub struct Package {
    pub name_version: NameVersion,
    /// Opaque handle to the installable payload inside the unpacked bundle
    /// view. Passed through to the package manager, never interpreted here.
    pub location: PathBuf,
    /// The same physical dependency package may appear under multiple
    /// parents within one bundle.
    pub dependencies: Vec<Arc<Package>>,
    /// When true the exact `(name, version)` pair must be preserved; only
    /// the dependency list may grow.
    pub version_essential: bool,
}

impl Package {
    pub fn new(name_version: NameVersion, location: PathBuf) -> Self {
        Package {
            name_version,
            location,
            dependencies: Vec::new(),
            version_essential: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name_version.name
    }

    pub fn version(&self) -> &str {
        &self.name_version.version
    }
}

/// The full local universe of packages available for offline repair.
///
/// Every package reachable from `packages`, nested dependencies included, is
/// assumed locally available without additional fetch cost.
#[derive(Debug, Default)]
pub struct Bundle {
    pub packages: Vec<Arc<Package>>,
}

impl Bundle {
    /// Build the name lookup over everything reachable in the bundle,
    /// top-level entries and nested dependencies alike.
    pub fn index(&self) -> PackageIndex {
        let mut index = PackageIndex::default();
        let mut visited = HashSet::new();
        for package in &self.packages {
            index.insert_tree(package, &mut visited);
        }
        index
    }
}

/// Name to shared-package lookup across the whole bundle graph.
#[derive(Debug, Default)]
pub struct PackageIndex {
    by_name: HashMap<String, Arc<Package>>,
}

impl PackageIndex {
    pub fn get(&self, name: &str) -> Option<&Arc<Package>> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    fn insert_tree(&mut self, package: &Arc<Package>, visited: &mut HashSet<*const Package>) {
        if !visited.insert(Arc::as_ptr(package)) {
            return;
        }
        self.by_name
            .entry(package.name().to_string())
            .or_insert_with(|| Arc::clone(package));
        for dep in &package.dependencies {
            self.insert_tree(dep, visited);
        }
    }
}
