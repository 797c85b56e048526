//! One wizard run: configuration, backend client and state store, wired
//! together. Every step of the wizard has an entry point here.

use std::sync::Arc;

use url::Url;

use crate::api::{
    paths, EdulutionConfig, InstallerApi, LetsEncryptCertificateRequest,
    LetsEncryptCertificateResponse, RequirementsResponse, SelfSignedCertificateRequest,
    SshConnection, StatusResponse,
};
use crate::channel::{ChannelHandle, InstallJob, WebSocketConnector};
use crate::config::WizardConfig;
use crate::error::{Result, WizardError};
use crate::feed::{strategy_for, BootstrapClient, FeedHandle, StoreFeedCallbacks};
use crate::finalize::{Finalizer, FinalizerHandle, HttpProbe, RedirectReason};
use crate::health::{self, HealthChecks};
use crate::log::*;
use crate::state::{CheckKey, JobKind, WizardStore};

/// Playbook that installs a linuxmuster.net server.
pub const LMN_PLAYBOOK: &str = "linuxmuster.yml";

#[derive(Debug, Clone)]
pub struct WizardSession {
    config: Arc<WizardConfig>,
    api: InstallerApi,
    store: WizardStore,
}

impl WizardSession {
    pub fn new(config: WizardConfig) -> Result<Self> {
        let api = InstallerApi::new(config.base_url().clone())?
            .with_request_timeout(config.request_timeout());
        Ok(Self::with_parts(config, api, WizardStore::new()))
    }

    pub fn with_parts(config: WizardConfig, api: InstallerApi, store: WizardStore) -> Self {
        Self {
            config: Arc::new(config),
            api,
            store,
        }
    }

    pub fn config(&self) -> &WizardConfig {
        &self.config
    }

    pub fn api(&self) -> &InstallerApi {
        &self.api
    }

    pub fn store(&self) -> &WizardStore {
        &self.store
    }

    pub fn health_checks(&self) -> HealthChecks {
        HealthChecks::for_api(self.store.clone(), &self.api)
    }

    /// Run the four installer checks. Returns the proceed gate.
    pub async fn run_checks(&self) -> bool {
        self.health_checks().run_all().await
    }

    pub async fn rerun_check(&self, key: CheckKey) {
        self.health_checks().run_check(key).await
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn verify_token(&self, token: &str) -> Result<bool> {
        let valid = self.api.check_token(token).await?;
        info!("session: token valid: {}", valid);
        Ok(valid)
    }

    pub async fn detect_proxy(&self) -> Result<bool> {
        let detected = self.api.proxy_check().await?.proxy_detected;
        self.store.set_proxy_detected(detected);
        Ok(detected)
    }

    /// Lightweight probe of the target server before asking for SSH
    /// credentials.
    pub async fn check_lmn_connection(&self, host: &str) -> Result<StatusResponse> {
        self.api
            .check_lmn_connection(host)
            .await?
            .into_result(paths::LMN_CHECK_CONNECTION)
    }

    pub async fn lmn_installer_health(&self) -> Result<StatusResponse> {
        self.api
            .lmn_health()
            .await?
            .into_result(paths::LMN_HEALTH)
    }

    pub async fn check_requirements(&self, playbook: &str) -> Option<RequirementsResponse> {
        health::check_requirements(&self.api, &self.store, playbook).await
    }

    pub fn bootstrap_client(&self) -> Result<BootstrapClient> {
        Ok(BootstrapClient::new(strategy_for(
            &self.api,
            self.config.feed(),
        )?))
    }

    /// Start a bootstrap attempt. The output log is cleared and the job
    /// status follows the feed.
    #[tracing::instrument(skip(self))]
    pub async fn bootstrap(&self, ssh: SshConnection) -> Result<FeedHandle> {
        if !ssh.is_complete() {
            return Err(WizardError::Config(
                "ssh host, user and password are required".into(),
            ));
        }
        let client = self.bootstrap_client()?;
        self.store.set_ssh(ssh.clone());
        self.store.begin_attempt(JobKind::Bootstrap);
        Ok(client
            .start(
                &ssh,
                StoreFeedCallbacks::new(self.store.clone(), JobKind::Bootstrap),
            )
            .await)
    }

    pub fn install_job(&self) -> Result<InstallJob> {
        let socket = self.api.socket_endpoint(paths::LMN_OUTPUT_SOCKET)?;
        Ok(InstallJob::new(
            self.store.clone(),
            Arc::new(WebSocketConnector::new(socket)),
            Arc::new(self.api.clone()),
            *self.config.channel().close_policy(),
        ))
    }

    /// Run `playbook` with the stored server settings as extra vars.
    #[tracing::instrument(skip(self))]
    pub async fn install(&self, playbook: &str) -> Result<ChannelHandle> {
        let job = self.install_job()?;
        let extra_vars = self.store.read(|state| state.lmn.extra_vars());
        Ok(job.start(playbook, extra_vars).await)
    }

    /// Pull the bind credentials created by the install and merge them into
    /// the configuration.
    pub async fn fetch_derived_config(&self) -> Result<EdulutionConfig> {
        let derived = self.api.edulution_config().await?;
        self.store.apply_derived_config(&derived);
        info!("session: bind user {} taken over", derived.binduser_dn);
        Ok(derived)
    }

    /// Stop the temporary linuxmuster.net installer once its output is no
    /// longer needed.
    pub async fn shutdown_lmn_installer(&self) -> Result<()> {
        self.api
            .shutdown_lmn_installer()
            .await?
            .into_result(paths::LMN_SHUTDOWN)?;
        Ok(())
    }

    pub async fn submit_configuration(&self) -> Result<StatusResponse> {
        let request = self
            .store
            .read(|state| state.configuration.to_request())?;
        self.api
            .submit_configuration(&request)
            .await?
            .into_result(paths::CONFIGURE)
    }

    pub async fn set_admin_group(&self, group: &str) -> Result<()> {
        self.api
            .set_admin_group(group)
            .await?
            .into_result(paths::SET_ADMIN_GROUP)?;
        self.store.set_initial_admin_group(group);
        Ok(())
    }

    pub async fn create_self_signed_certificate(
        &self,
        request: &SelfSignedCertificateRequest,
    ) -> Result<()> {
        self.api
            .create_self_signed_certificate(request)
            .await?
            .into_result(paths::CREATE_SS_CERTIFICATE)?;
        self.store.set_certificate_configured(true);
        Ok(())
    }

    pub async fn create_lets_encrypt_certificate(
        &self,
        request: &LetsEncryptCertificateRequest,
    ) -> Result<LetsEncryptCertificateResponse> {
        let response = self.api.create_lets_encrypt_certificate(request).await?;
        if !response.status {
            return Err(WizardError::Application {
                endpoint: paths::CREATE_LE_CERTIFICATE.into(),
                message: response.message,
            });
        }
        if let Some(registration) = &response.registration {
            info!(
                "session: acme-dns registration for {}, add a CNAME to {}",
                registration.subdomain, registration.fulldomain
            );
        }
        self.store.set_certificate_configured(true);
        Ok(response)
    }

    pub async fn upload_certificate(&self, cert: Vec<u8>, key: Vec<u8>) -> Result<()> {
        self.api
            .upload_certificate(cert, key)
            .await?
            .into_result(paths::UPLOAD_CERTIFICATE)?;
        self.store.set_certificate_configured(true);
        Ok(())
    }

    pub fn finalizer(&self) -> Result<Finalizer> {
        let settings = self.config.finalizer();
        Ok(Finalizer::new(
            Arc::new(self.api.clone()),
            Arc::new(HttpProbe::new(*settings.accept_invalid_certs())?),
            self.config.target_url()?,
            settings.timings(),
        ))
    }

    /// Commit, restart and hand off. `redirect` fires once, when the
    /// installed application answers or at the fallback deadline.
    pub fn finalize<F>(&self, redirect: F) -> Result<FinalizerHandle>
    where
        F: FnOnce(&Url, RedirectReason) + Send + 'static,
    {
        Ok(self.finalizer()?.finalize(redirect))
    }
}
