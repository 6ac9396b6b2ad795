//! The repair engine.
//!
//! The unit of work is "make this one target package installable", given the
//! bundle as a source of substitute packages. Each cycle simulates the
//! installation, classifies the verdict, and either backfills missing
//! dependencies from the bundle, substitutes an unconstrained package with
//! its latest installable version, or gives up with a diagnostic. Cycles
//! repeat inside a bounded retry loop so a pathological bundle cannot spin
//! forever.

use log::debug;
use std::sync::Arc;

use crate::bundle::{Bundle, NameVersion, Package};
use crate::manager::{InstallVerdict, PackageManager};

/// How many simulate/repair cycles a repair run may use unless told
/// otherwise.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Structured terminal reason of a repair run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutcome {
    Succeeded,
    /// Dependencies the bundle could not supply, by name.
    MissingDependencies(Vec<String>),
    /// The package cannot be installed as-is and replacing it with the
    /// latest version is not possible (or not allowed).
    CannotSubstitute,
    BudgetExhausted,
    /// The package manager itself failed; the log carries the detail.
    ManagerError,
}

/// Accumulating record of one repair run.
#[derive(Debug)]
pub struct FixResult {
    /// Human-readable audit trail, one line per decision, in order. It is
    /// for operators only and never drives control flow.
    pub log: Vec<String>,
    pub success: bool,
    /// The package to carry forward on success. For an in-place repair this
    /// is the repaired target; for a substitution it is the freshly
    /// downloaded replacement and the original target is left untouched.
    pub package: Option<Package>,
    /// Set when a repair step changed state and the verdict should be
    /// re-checked before concluding.
    pub repeat: bool,
    pub attempts_left: u32,
    pub outcome: FixOutcome,
}

impl FixResult {
    fn new(attempts: u32) -> Self {
        FixResult {
            log: Vec::new(),
            success: false,
            package: None,
            repeat: false,
            attempts_left: attempts,
            outcome: FixOutcome::BudgetExhausted,
        }
    }

    pub fn add_log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }
}

/// Repairs one target package at a time against the bundle.
pub struct FixEngine<'a, M: PackageManager> {
    manager: &'a M,
    attempts: u32,
}

impl<'a, M: PackageManager> FixEngine<'a, M> {
    pub fn new(manager: &'a M) -> Self {
        Self::with_attempts(manager, DEFAULT_ATTEMPTS)
    }

    pub fn with_attempts(manager: &'a M, attempts: u32) -> Self {
        FixEngine { manager, attempts }
    }

    /// Run simulate/repair cycles until the target installs cleanly, a
    /// terminal diagnosis is reached, or the attempt budget runs out.
    ///
    /// Backfilled dependencies are appended to `target` in place and are
    /// kept even when a later step fails; they represent genuine progress.
    #[tracing::instrument(skip(self, target, bundle), fields(package = %target.name()))]
    pub async fn repair(&self, target: &mut Package, bundle: &Bundle) -> FixResult {
        let mut res = FixResult::new(self.attempts);
        res.add_log(format!(
            "Checking whether package \"{}\" can be installed; \
             the package and its dependencies will be updated if it cannot.",
            target.name()
        ));
        loop {
            res.repeat = false;
            self.simulate(target, bundle, &mut res).await;
            if !res.repeat {
                break;
            }
            if res.attempts_left == 0 {
                res.add_log(
                    "Ran out of repair attempts; giving up so this does not loop forever.",
                );
                res.outcome = FixOutcome::BudgetExhausted;
                break;
            }
            res.attempts_left -= 1;
            res.add_log(format!("Going again. Attempts left: {}.", res.attempts_left));
        }
        if res.success {
            if res.package.is_none() {
                res.package = Some(target.clone());
            }
            res.add_log("SUCCESS");
        } else {
            res.add_log("FAILED");
        }
        res
    }

    async fn simulate(&self, target: &mut Package, bundle: &Bundle, res: &mut FixResult) {
        res.add_log("Simulating installation of the package.");
        let check = match self.manager.check_install(target).await {
            Ok(check) => check,
            Err(err) => {
                res.add_log(format!("Could not simulate the installation: {err:#}"));
                res.outcome = FixOutcome::ManagerError;
                return;
            }
        };
        debug!("simulation verdict for {}: {:?}", target.name(), check.verdict);
        match check.verdict {
            InstallVerdict::Ok => {
                res.add_log(
                    "Simulated installation was successful. Downloading the dependencies.",
                );
                if let Err(err) = self.manager.update_dependencies(target).await {
                    res.add_log(format!("Could not update the package dependencies: {err:#}"));
                    res.outcome = FixOutcome::ManagerError;
                    return;
                }
                res.add_log("Package dependencies successfully updated.");
                res.success = true;
                res.outcome = FixOutcome::Succeeded;
            }
            InstallVerdict::UnmetDependencies => {
                res.add_log(format!(
                    "Cannot install the package in its current state. Reason: \
                     the following dependencies are not met:\n{}",
                    render_dependency_list(&check.unmet_dependencies)
                ));
                self.resolve_dependencies(target, bundle, &check.unmet_dependencies, res)
                    .await;
            }
            InstallVerdict::NewerAlreadyInstalled => {
                res.add_log(
                    "Cannot install the package in its current state. Reason: \
                     a newer version of the package is already installed.",
                );
                self.substitute_or_give_up(target, res).await;
            }
            _ => {
                res.add_log("Cannot install the package in its current state.");
                self.substitute_or_give_up(target, res).await;
            }
        }
    }

    /// Backfill unmet dependencies from the bundle, provided the target's
    /// exact version matters. When it does not, replacing the whole package
    /// is preferred over patching its dependency list.
    async fn resolve_dependencies(
        &self,
        target: &mut Package,
        bundle: &Bundle,
        unmet: &[NameVersion],
        res: &mut FixResult,
    ) {
        if !target.version_essential {
            self.substitute_or_give_up(target, res).await;
            return;
        }
        res.add_log(
            "This exact version of the package is required. \
             Searching the bundle for the missing dependencies.",
        );
        let index = bundle.index();
        let mut missing = Vec::new();
        for dep in unmet {
            match index.get(&dep.name) {
                Some(found) => {
                    target.dependencies.push(Arc::clone(found));
                    res.add_log(format!(
                        "Package {} found in the bundle and added to the dependencies.",
                        dep.name
                    ));
                }
                None => {
                    res.add_log(format!(
                        "Could not find required dependency package {} in the bundle.",
                        dep.name
                    ));
                    missing.push(dep.name.clone());
                }
            }
        }
        if !missing.is_empty() {
            res.add_log(
                "Some dependencies are missing from the bundle. Please supply them manually.",
            );
            res.outcome = FixOutcome::MissingDependencies(missing);
            return;
        }
        res.add_log(
            "All required packages were found and added to the dependencies. \
             Checking once more whether the package can be installed.",
        );
        res.repeat = true;
    }

    async fn substitute_or_give_up(&self, target: &Package, res: &mut FixResult) {
        if target.version_essential {
            res.add_log(
                "This exact version of the package is required but cannot be installed. \
                 Please download the package and its dependencies manually.",
            );
            res.outcome = FixOutcome::CannotSubstitute;
            return;
        }
        res.add_log(
            "The exact version of the package is not required, \
             so the latest version will be used instead.",
        );
        self.replace_with_latest(target, res).await;
    }

    async fn replace_with_latest(&self, target: &Package, res: &mut FixResult) {
        res.add_log("Checking whether the latest version of the package can be installed.");
        let verdict = match self.manager.check_install_latest(target.name()).await {
            Ok(verdict) => verdict,
            Err(err) => {
                res.add_log(format!(
                    "Could not check whether the latest version can be installed: {err:#}"
                ));
                res.outcome = FixOutcome::ManagerError;
                return;
            }
        };
        if verdict != InstallVerdict::Ok {
            res.add_log(
                "Even the latest version of the package cannot be installed. \
                 Please escalate to a human operator.",
            );
            res.outcome = FixOutcome::CannotSubstitute;
            return;
        }
        res.add_log(
            "The latest version can be installed. \
             Downloading the package and its dependencies.",
        );
        match self.manager.download_latest_version(target.name()).await {
            Ok(replacement) => {
                res.success = true;
                res.package = Some(replacement);
                res.outcome = FixOutcome::Succeeded;
            }
            Err(err) => {
                res.add_log(format!(
                    "Could not download the latest version of the package \
                     or its dependencies: {err:#}"
                ));
                res.outcome = FixOutcome::ManagerError;
            }
        }
    }
}

fn render_dependency_list(deps: &[NameVersion]) -> String {
    let lines: Vec<String> = deps.iter().map(|d| d.to_string()).collect();
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ExecutionError, InstallResult, InstallVerdict, MockPackageManager};
    use crate::test_utils::{bundle_of, essential_package, package};
    use mockall::Sequence;

    fn unmet(names: &[(&str, &str)]) -> InstallResult {
        InstallResult {
            verdict: InstallVerdict::UnmetDependencies,
            package: None,
            unmet_dependencies: names
                .iter()
                .map(|(n, v)| NameVersion::new(*n, *v))
                .collect(),
        }
    }

    fn verdict_only(verdict: InstallVerdict) -> InstallResult {
        InstallResult {
            verdict,
            package: None,
            unmet_dependencies: Vec::new(),
        }
    }

    fn launch_failure() -> anyhow::Error {
        ExecutionError {
            command: "apt-get -s install -y".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "sh: not found"),
        }
        .into()
    }

    #[tokio::test]
    async fn test_already_ok_target_succeeds_without_retries() {
        // A target that simulates cleanly is done after the first attempt:
        // no retries consumed, no dependency mutation beyond what
        // update_dependencies itself performs.

        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Ok(verdict_only(InstallVerdict::Ok)));
        manager
            .expect_update_dependencies()
            .times(1)
            .returning(|_| Ok(()));

        let mut target = essential_package("kubeadm", "1.13.0");
        let bundle = bundle_of(vec![]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(res.success);
        assert_eq!(res.outcome, FixOutcome::Succeeded);
        assert_eq!(res.attempts_left, DEFAULT_ATTEMPTS);
        assert!(target.dependencies.is_empty());
        // Essential identity never changes.
        let repaired = res.package.unwrap();
        assert_eq!(repaired.name(), "kubeadm");
        assert_eq!(repaired.version(), "1.13.0");
        assert_eq!(*res.log.last().unwrap(), "SUCCESS");
    }

    #[tokio::test]
    async fn test_backfill_then_success_consumes_one_retry() {
        // First simulation reports an unmet kubelet dependency, the bundle
        // has kubelet, the second simulation is clean.

        let mut seq = Sequence::new();
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(unmet(&[("kubelet", "1.13.0")])));
        manager
            .expect_check_install()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(verdict_only(InstallVerdict::Ok)));
        manager
            .expect_update_dependencies()
            .times(1)
            .returning(|_| Ok(()));

        let mut target = essential_package("kubeadm", "1.13.0");
        let bundle = bundle_of(vec![package("kubelet", "1.13.0")]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(res.success);
        assert_eq!(res.outcome, FixOutcome::Succeeded);
        assert_eq!(res.attempts_left, DEFAULT_ATTEMPTS - 1);
        assert_eq!(target.dependencies.len(), 1);
        assert_eq!(target.dependencies[0].name(), "kubelet");
        let repaired = res.package.unwrap();
        assert_eq!(repaired.name(), "kubeadm");
        assert_eq!(repaired.version(), "1.13.0");
    }

    #[tokio::test]
    async fn test_backfill_finds_nested_dependency() {
        // The needed package sits nested under another bundle entry, not at
        // the top level; the lookup still finds it.

        let mut seq = Sequence::new();
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(unmet(&[("socat", "1.7.3"), ("conntrack", "")])));
        manager
            .expect_check_install()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(verdict_only(InstallVerdict::Ok)));
        manager
            .expect_update_dependencies()
            .times(1)
            .returning(|_| Ok(()));

        let mut carrier = package("kubelet", "1.13.0");
        carrier
            .dependencies
            .push(Arc::new(package("conntrack", "1.4.4")));
        let bundle = bundle_of(vec![package("socat", "1.7.3"), carrier]);

        let mut target = essential_package("kubeadm", "1.13.0");
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(res.success);
        assert_eq!(target.dependencies.len(), 2);
        assert_eq!(target.dependencies[0].name(), "socat");
        assert_eq!(target.dependencies[1].name(), "conntrack");
    }

    #[tokio::test]
    async fn test_backfill_reuses_bundle_package_object() {
        let mut seq = Sequence::new();
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(unmet(&[("kubelet", "1.13.0")])));
        manager
            .expect_check_install()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(verdict_only(InstallVerdict::Ok)));
        manager
            .expect_update_dependencies()
            .times(1)
            .returning(|_| Ok(()));

        let bundle = bundle_of(vec![package("kubelet", "1.13.0")]);
        let mut target = essential_package("kubeadm", "1.13.0");
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(res.success);
        // The very same package object from the bundle, not a copy.
        assert!(Arc::ptr_eq(&target.dependencies[0], &bundle.packages[0]));
    }

    #[tokio::test]
    async fn test_missing_dependency_fails_without_retry() {
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Ok(unmet(&[("cri-tools", "1.12.0")])));

        let mut target = essential_package("kubeadm", "1.13.0");
        let bundle = bundle_of(vec![package("kubelet", "1.13.0")]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(!res.success);
        assert!(res.package.is_none());
        assert_eq!(
            res.outcome,
            FixOutcome::MissingDependencies(vec!["cri-tools".to_string()])
        );
        assert_eq!(res.attempts_left, DEFAULT_ATTEMPTS);
        assert!(res.log.iter().any(|l| l.contains("cri-tools")));
        assert_eq!(*res.log.last().unwrap(), "FAILED");
    }

    #[tokio::test]
    async fn test_partial_backfill_is_kept_on_failure() {
        // Unmet {A, C} where the bundle has A but not C: the run fails
        // naming exactly C, yet A stays appended to the dependency list.

        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Ok(unmet(&[("socat", "1.7.3"), ("cri-tools", "")])));

        let mut target = essential_package("kubeadm", "1.13.0");
        let bundle = bundle_of(vec![package("socat", "1.7.3")]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(!res.success);
        assert_eq!(
            res.outcome,
            FixOutcome::MissingDependencies(vec!["cri-tools".to_string()])
        );
        assert_eq!(target.dependencies.len(), 1);
        assert_eq!(target.dependencies[0].name(), "socat");
    }

    #[tokio::test]
    async fn test_unmet_dependencies_on_replaceable_target_substitutes() {
        // When the exact version is not required, unmet dependencies do not
        // trigger a bundle search; the whole package is replaced instead.

        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Ok(unmet(&[("libssl1.1", "")])));
        manager
            .expect_check_install_latest()
            .times(1)
            .returning(|_| Ok(InstallVerdict::Ok));
        manager
            .expect_download_latest_version()
            .times(1)
            .returning(|name| Ok(package(name, "7.64.0")));

        let mut target = package("curl", "7.52.1");
        let bundle = bundle_of(vec![package("libssl1.1", "1.1.0")]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(res.success);
        // No backfill happened.
        assert!(target.dependencies.is_empty());
        let replacement = res.package.unwrap();
        assert_eq!(replacement.name(), "curl");
        assert_eq!(replacement.version(), "7.64.0");
    }

    #[tokio::test]
    async fn test_newer_installed_replaces_with_latest() {
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Ok(verdict_only(InstallVerdict::NewerAlreadyInstalled)));
        manager
            .expect_check_install_latest()
            .times(1)
            .returning(|_| Ok(InstallVerdict::Ok));
        manager
            .expect_download_latest_version()
            .times(1)
            .returning(|name| Ok(package(name, "7.64.0")));

        let mut target = package("curl", "7.52.1");
        let bundle = bundle_of(vec![]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(res.success);
        assert_eq!(res.outcome, FixOutcome::Succeeded);
        let replacement = res.package.unwrap();
        assert_eq!(replacement.name(), "curl");
        assert_eq!(replacement.version(), "7.64.0");
    }

    #[tokio::test]
    async fn test_essential_target_is_never_substituted() {
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Ok(verdict_only(InstallVerdict::NewerAlreadyInstalled)));
        // No latest-version expectations: touching them would panic.

        let mut target = essential_package("kubeadm", "1.13.0");
        let bundle = bundle_of(vec![]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(!res.success);
        assert_eq!(res.outcome, FixOutcome::CannotSubstitute);
        assert!(res.package.is_none());
    }

    #[tokio::test]
    async fn test_latest_version_also_failing_gives_up() {
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Ok(verdict_only(InstallVerdict::UnknownProblem)));
        manager
            .expect_check_install_latest()
            .times(1)
            .returning(|_| Ok(InstallVerdict::CannotFindPackage));
        // download_latest_version must not be called.

        let mut target = package("curl", "7.52.1");
        let bundle = bundle_of(vec![]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(!res.success);
        assert_eq!(res.outcome, FixOutcome::CannotSubstitute);
        assert!(res.log.iter().any(|l| l.contains("latest version")));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_stops_the_loop() {
        // Backfill keeps succeeding and re-triggering re-simulation; with a
        // budget of 1 the engine performs the single permitted retry and
        // then stops instead of looping.

        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(2)
            .returning(|_| Ok(unmet(&[("kubelet", "1.13.0")])));

        let mut target = essential_package("kubeadm", "1.13.0");
        let bundle = bundle_of(vec![package("kubelet", "1.13.0")]);
        let engine = FixEngine::with_attempts(&manager, 1);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(!res.success);
        assert_eq!(res.outcome, FixOutcome::BudgetExhausted);
        assert_eq!(res.attempts_left, 0);
    }

    #[tokio::test]
    async fn test_simulation_launch_failure_is_fatal() {
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Err(launch_failure()));

        let mut target = essential_package("kubeadm", "1.13.0");
        let bundle = bundle_of(vec![]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(!res.success);
        assert_eq!(res.outcome, FixOutcome::ManagerError);
        assert_eq!(res.attempts_left, DEFAULT_ATTEMPTS);
        assert!(res.log.iter().any(|l| l.contains("Could not simulate")));
    }

    #[tokio::test]
    async fn test_update_dependencies_failure_is_fatal() {
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Ok(verdict_only(InstallVerdict::Ok)));
        manager
            .expect_update_dependencies()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("network unreachable")));

        let mut target = essential_package("kubeadm", "1.13.0");
        let bundle = bundle_of(vec![]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(!res.success);
        assert_eq!(res.outcome, FixOutcome::ManagerError);
    }

    #[tokio::test]
    async fn test_download_failure_is_fatal() {
        let mut manager = MockPackageManager::new();
        manager
            .expect_check_install()
            .times(1)
            .returning(|_| Ok(verdict_only(InstallVerdict::NewerAlreadyInstalled)));
        manager
            .expect_check_install_latest()
            .times(1)
            .returning(|_| Ok(InstallVerdict::Ok));
        manager
            .expect_download_latest_version()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("mirror unreachable")));

        let mut target = package("curl", "7.52.1");
        let bundle = bundle_of(vec![]);
        let engine = FixEngine::new(&manager);
        let res = engine.repair(&mut target, &bundle).await;

        assert!(!res.success);
        assert_eq!(res.outcome, FixOutcome::ManagerError);
        assert!(res.package.is_none());
    }

    #[test]
    fn test_render_dependency_list() {
        let deps = vec![
            NameVersion::new("kubelet", "1.13.0"),
            NameVersion::new("cri-tools", ""),
        ];
        assert_eq!(
            render_dependency_list(&deps),
            "kubelet (>= 1.13.0)\ncri-tools"
        );
    }
}
