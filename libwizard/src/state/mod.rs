//! The wizard's shared state. One [`WizardStore`] per wizard session; clone
//! the handle into every component that needs it.
//!
//! Every mutation is a synchronous closure over the previous state, applied
//! atomically and visible to the next read. Subscribers (the UI layer) get
//! notified through a `watch` channel and re-render from a fresh snapshot.

use std::sync::Arc;

use tokio::sync::watch;

use crate::api::{DeploymentTarget, EdulutionConfig, RequirementsResponse, SshConnection};
use crate::error::{Result, WizardError};
use crate::log::*;

mod bundle;
mod checks;
mod job;

pub use bundle::*;
pub use checks::*;
pub use job::*;

#[derive(Clone, Debug, Default)]
pub struct WizardState {
    pub configuration: ConfigurationBundle,
    pub lmn: LmnConfig,
    /// Only kept so a retry can reuse the form input.
    pub ssh: Option<SshConnection>,
    pub checks: ChecksState,
    pub requirements: Option<RequirementsResponse>,
    pub lmn_requirements_passed: bool,
    pub bootstrap_status: JobStatus,
    pub playbook_status: JobStatus,
    pub lmn_output: OutputLog,
}

impl WizardState {
    pub fn job_status(&self, kind: JobKind) -> JobStatus {
        match kind {
            JobKind::Bootstrap => self.bootstrap_status,
            JobKind::Playbook => self.playbook_status,
        }
    }

    /// `Ok` once the job completed. Otherwise a [`WizardError::JobFailed`]
    /// carrying the last output line, which holds the failure reason.
    pub fn job_result(&self, kind: JobKind) -> Result<()> {
        match self.job_status(kind) {
            JobStatus::Completed => Ok(()),
            status => {
                let last = self.lmn_output.lines().last().map(|l| l.text.as_str());
                Err(WizardError::JobFailed(match last {
                    Some(line) => format!("{kind} ended {status}: {line}"),
                    None => format!("{kind} ended {status}"),
                }))
            }
        }
    }

    fn job_status_mut(&mut self, kind: JobKind) -> &mut JobStatus {
        match kind {
            JobKind::Bootstrap => &mut self.bootstrap_status,
            JobKind::Playbook => &mut self.playbook_status,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WizardStore {
    tx: Arc<watch::Sender<WizardState>>,
}

impl Default for WizardStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WizardStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(WizardState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<WizardState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> WizardState {
        self.tx.borrow().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&WizardState) -> R) -> R {
        f(&self.tx.borrow())
    }

    fn update(&self, f: impl FnOnce(&mut WizardState)) {
        self.tx.send_modify(f);
    }

    pub fn reset(&self) {
        self.update(|state| *state = WizardState::default());
    }

    pub fn set_deployment_target(&self, target: DeploymentTarget) {
        self.update(|state| state.configuration.deployment_target = Some(target));
    }

    /// Domain and bind credentials decoded from the setup token.
    pub fn set_token_data<S: Into<String>>(
        &self,
        lmn_external_domain: S,
        binduser_dn: S,
        binduser_pw: S,
    ) {
        let (domain, dn, pw) = (
            lmn_external_domain.into(),
            binduser_dn.into(),
            binduser_pw.into(),
        );
        self.update(|state| {
            state.configuration.lmn_external_domain = domain;
            state.configuration.lmn_binduser_dn = dn;
            state.configuration.lmn_binduser_pw = pw;
        });
    }

    /// Replace the form-owned part of the configuration. Flags set by other
    /// steps (certificate, proxy, admin group) are kept.
    pub fn set_configuration(&self, config: ConfigurationBundle) {
        self.update(|state| {
            let current = &mut state.configuration;
            current.deployment_target = config.deployment_target.or(current.deployment_target);
            current.lmn_external_domain = config.lmn_external_domain;
            current.lmn_binduser_dn = config.lmn_binduser_dn;
            current.lmn_binduser_pw = config.lmn_binduser_pw;
            current.lmn_ldap_schema = config.lmn_ldap_schema;
            current.lmn_ldap_port = config.lmn_ldap_port;
            current.edulution_external_domain = config.edulution_external_domain;
        });
    }

    pub fn apply_derived_config(&self, derived: &EdulutionConfig) {
        self.update(|state| state.configuration.apply_derived(derived));
    }

    pub fn set_initial_admin_group<S: Into<String>>(&self, group: S) {
        let group = group.into();
        self.update(|state| state.configuration.initial_admin_group = group);
    }

    pub fn set_certificate_configured(&self, value: bool) {
        self.update(|state| state.configuration.certificate_configured = value);
    }

    pub fn set_proxy_detected(&self, value: bool) {
        self.update(|state| state.configuration.proxy_detected = value);
    }

    pub fn set_lmn_config(&self, config: LmnConfig) {
        self.update(|state| state.lmn = config);
    }

    pub fn set_ssh(&self, ssh: SshConnection) {
        self.update(|state| state.ssh = Some(ssh));
    }

    pub fn clear_ssh(&self) {
        self.update(|state| state.ssh = None);
    }

    pub fn set_check_result(&self, key: CheckKey, result: CheckResult) {
        self.update(|state| state.checks.set_result(key, result));
    }

    pub fn set_check_loading(&self, key: CheckKey, loading: bool) {
        self.update(|state| state.checks.set_loading(key, loading));
    }

    /// Record a finished probe and drop its loading flag in one step.
    pub fn finish_check(&self, key: CheckKey, result: CheckResult) {
        self.update(|state| {
            state.checks.set_result(key, result);
            state.checks.set_loading(key, false);
        });
    }

    pub fn reset_checks(&self) {
        self.update(|state| state.checks.clear_results());
    }

    pub fn set_requirements(&self, requirements: Option<RequirementsResponse>) {
        self.update(|state| {
            state.lmn_requirements_passed = requirements.as_ref().is_some_and(|r| r.all_passed);
            state.requirements = requirements;
        });
    }

    pub fn append_lmn_output<S: Into<String>>(&self, line: S) {
        let line = line.into();
        self.update(|state| {
            state.lmn_output.append(line);
        });
    }

    pub fn clear_lmn_output(&self) {
        self.update(|state| state.lmn_output.clear());
    }

    /// Apply a status transition. Returns `false` (and leaves the state
    /// untouched) when the transition is not allowed, e.g. leaving a terminal
    /// state without a reset.
    pub fn set_job_status(&self, kind: JobKind, next: JobStatus) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            let current = state.job_status_mut(kind);
            if current.can_transition_to(next) {
                applied = true;
                let changed = *current != next;
                *current = next;
                changed
            } else {
                false
            }
        });
        if !applied {
            debug!(?kind, ?next, "store: ignored job status transition");
        }
        applied
    }

    /// Reset a job for a new attempt: status goes idle -> running and the
    /// output log starts over.
    pub fn begin_attempt(&self, kind: JobKind) {
        self.update(|state| {
            *state.job_status_mut(kind) = JobStatus::Running;
            state.lmn_output.clear();
        });
    }

    pub fn job_status(&self, kind: JobKind) -> JobStatus {
        self.read(|state| state.job_status(kind))
    }
}
