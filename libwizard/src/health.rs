//! Health-check aggregation. Each named probe runs on its own; the results
//! land in the [`WizardStore`] and the proceed gate is derived from them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::api::{InstallerApi, RequirementsResponse};
use crate::error::Result;
use crate::log::*;
use crate::state::{CheckKey, CheckResult, WizardStore};

/// An asynchronous status probe. Errors are recorded as a failed check, never
/// propagated.
#[async_trait]
pub trait StatusProbe: std::fmt::Debug + Send + Sync {
    async fn probe(&self) -> Result<CheckResult>;
}

/// Probe backed by one of the installer's `check-*-status` endpoints.
#[derive(Debug, Clone)]
pub struct ApiStatusProbe {
    api: InstallerApi,
    key: CheckKey,
}

impl ApiStatusProbe {
    pub fn new(api: InstallerApi, key: CheckKey) -> Self {
        Self { api, key }
    }
}

#[async_trait]
impl StatusProbe for ApiStatusProbe {
    async fn probe(&self) -> Result<CheckResult> {
        Ok(self.api.check_status(self.key).await?.into())
    }
}

#[derive(Debug, Clone)]
pub struct HealthChecks {
    store: WizardStore,
    probes: BTreeMap<CheckKey, Arc<dyn StatusProbe>>,
}

impl HealthChecks {
    pub fn new(store: WizardStore) -> Self {
        Self {
            store,
            probes: BTreeMap::new(),
        }
    }

    /// All four installer checks, wired to the backend.
    pub fn for_api(store: WizardStore, api: &InstallerApi) -> Self {
        CheckKey::ALL.iter().fold(Self::new(store), |checks, key| {
            checks.with_probe(*key, ApiStatusProbe::new(api.clone(), *key))
        })
    }

    pub fn with_probe<P: StatusProbe + 'static>(mut self, key: CheckKey, probe: P) -> Self {
        self.probes.insert(key, Arc::new(probe));
        self
    }

    /// Run one probe. Only this key's loading flag and result are touched.
    #[tracing::instrument(skip(self))]
    pub async fn run_check(&self, key: CheckKey) {
        self.store.set_check_loading(key, true);
        let result = match self.probes.get(&key) {
            Some(probe) => match probe.probe().await {
                Ok(result) => result,
                Err(err) => {
                    warn!("health: check {} failed: {}", key, err);
                    CheckResult::connection_error()
                }
            },
            None => {
                warn!("health: no probe registered for {}", key);
                CheckResult::failed(format!("no probe registered for {key}"))
            }
        };
        debug!("health: {} -> {}", key, result.status);
        self.store.finish_check(key, result);
    }

    /// Clear every result, then run all probes concurrently. Completion
    /// order is whatever the network gives us.
    #[tracing::instrument(skip(self))]
    pub async fn run_all(&self) -> bool {
        self.store.reset_checks();
        let mut pending: FuturesUnordered<_> =
            CheckKey::ALL.iter().map(|key| self.run_check(*key)).collect();
        while pending.next().await.is_some() {}
        let passed = self.all_passed();
        info!("health: all checks finished, passed: {}", passed);
        passed
    }

    pub fn all_passed(&self) -> bool {
        self.store.read(|state| state.checks.all_passed())
    }
}

/// Fetch the requirement evaluation for a playbook and record whether it
/// passed. A failed fetch closes the gate.
#[tracing::instrument(skip(api, store))]
pub async fn check_requirements(
    api: &InstallerApi,
    store: &WizardStore,
    playbook: &str,
) -> Option<RequirementsResponse> {
    match api.lmn_requirements(playbook).await {
        Ok(requirements) => {
            for check in requirements.checks.iter() {
                debug!("requirements: {} {:?}: {}", check.name, check.status, check.message);
            }
            store.set_requirements(Some(requirements.clone()));
            Some(requirements)
        }
        Err(err) => {
            warn!("requirements: fetching for {} failed: {}", playbook, err);
            store.set_requirements(None);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::error::WizardError;

    #[derive(Debug)]
    struct FixedProbe(CheckResult);

    #[async_trait]
    impl StatusProbe for FixedProbe {
        async fn probe(&self) -> Result<CheckResult> {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct BrokenProbe;

    #[async_trait]
    impl StatusProbe for BrokenProbe {
        async fn probe(&self) -> Result<CheckResult> {
            Err(WizardError::Config("unreachable".into()))
        }
    }

    /// Blocks until released, so the loading phase can be observed.
    #[derive(Debug, Default)]
    struct GatedProbe {
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StatusProbe for Arc<GatedProbe> {
        async fn probe(&self) -> Result<CheckResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(CheckResult::passed("ok"))
        }
    }

    fn passing(store: &WizardStore) -> HealthChecks {
        CheckKey::ALL.iter().fold(HealthChecks::new(store.clone()), |c, key| {
            c.with_probe(*key, FixedProbe(CheckResult::passed("ok")))
        })
    }

    #[tokio::test]
    async fn test_all_checks_passing_opens_gate() {
        let store = WizardStore::new();
        let checks = passing(&store);
        assert!(!checks.all_passed());
        assert!(checks.run_all().await);
        assert!(!store.read(|s| s.checks.any_loading()));
    }

    #[tokio::test]
    async fn test_probe_error_becomes_connection_error() {
        let store = WizardStore::new();
        let checks = passing(&store).with_probe(CheckKey::Ldap, BrokenProbe);
        assert!(!checks.run_all().await);
        let ldap = store.read(|s| s.checks.result(CheckKey::Ldap).cloned());
        assert_eq!(Some(CheckResult::connection_error()), ldap);
        assert!(!store.read(|s| s.checks.is_loading(CheckKey::Ldap)));
    }

    #[tokio::test]
    async fn test_rerun_single_check_leaves_others_alone() {
        let store = WizardStore::new();
        let checks = passing(&store).with_probe(
            CheckKey::Webdav,
            FixedProbe(CheckResult::failed("webdav down")),
        );
        checks.run_all().await;
        store.set_check_result(CheckKey::Api, CheckResult::passed("kept"));

        checks.run_check(CheckKey::Webdav).await;
        let api = store.read(|s| s.checks.result(CheckKey::Api).cloned());
        assert_eq!(Some(CheckResult::passed("kept")), api);
    }

    #[tokio::test]
    async fn test_run_all_hides_stale_results_while_loading() {
        let store = WizardStore::new();
        for key in CheckKey::ALL {
            store.set_check_result(key, CheckResult::passed("previous run"));
        }
        let gate = Arc::new(GatedProbe::default());
        let checks = CheckKey::ALL.iter().fold(HealthChecks::new(store.clone()), |c, key| {
            c.with_probe(*key, gate.clone())
        });

        let run = tokio::spawn(async move { checks.run_all().await });
        while gate.calls.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store.read(|s| {
            for key in CheckKey::ALL {
                assert!(s.checks.result(key).is_none(), "{key} shows a stale result");
                assert!(s.checks.is_loading(key));
            }
        });
        for _ in 0..4 {
            gate.release.notify_one();
        }
        assert!(run.await.unwrap());
    }
}
