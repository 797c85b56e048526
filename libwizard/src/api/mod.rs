//! Typed client for the installer backend's REST surface.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::time::timeout;
use url::Url;

use crate::error::{Result, WizardError};
use crate::log::*;
use crate::state::CheckKey;

pub mod types;

pub use types::*;

pub mod paths {
    pub const CHECK_TOKEN: &str = "/api/check-token";
    pub const CONFIGURE: &str = "/api/configure";
    pub const CHECK_API: &str = "/api/check-api-status";
    pub const CHECK_WEBDAV: &str = "/api/check-webdav-status";
    pub const CHECK_LDAP: &str = "/api/check-ldap-status";
    pub const CHECK_LDAP_ACCESS: &str = "/api/check-ldap-access-status";
    pub const SET_ADMIN_GROUP: &str = "/api/set-admin-group";
    pub const CREATE_SS_CERTIFICATE: &str = "/api/create-ss-certificate";
    pub const CREATE_LE_CERTIFICATE: &str = "/api/create-le-certificate";
    pub const UPLOAD_CERTIFICATE: &str = "/api/upload-certificate";
    pub const FINISH: &str = "/api/finish";
    pub const PROXY_CHECK: &str = "/api/proxy-check";
    pub const SHUTDOWN: &str = "/api/shutdown";
    pub const LMN_BOOTSTRAP: &str = "/api/lmn/bootstrap";
    pub const LMN_BOOTSTRAP_STREAM: &str = "/api/lmn/bootstrap/stream";
    pub const LMN_HEALTH: &str = "/api/lmn/health";
    pub const LMN_CHECK_CONNECTION: &str = "/api/lmn/check-connection";
    pub const LMN_EDULUTION_CONFIG: &str = "/api/lmn/edulution-config";
    pub const LMN_SHUTDOWN: &str = "/api/lmn/shutdown";
    pub const LMN_OUTPUT_SOCKET: &str = "/ws/lmn/output";

    pub fn lmn_requirements(playbook: &str) -> String {
        format!("/api/lmn/playbook/{playbook}/requirements")
    }

    pub fn lmn_playbook_start(playbook: &str) -> String {
        format!("/api/lmn/playbook/{playbook}/start")
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct InstallerApi {
    client: reqwest::Client,
    base_url: Url,
    request_timeout: Duration,
}

impl InstallerApi {
    pub fn new(base_url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| WizardError::Config(format!("building http client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self {
            client,
            base_url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Upper bound for waiting on the response head and, for JSON calls, the
    /// body. Streamed bodies are not bounded.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| WizardError::InvalidUrl {
            url: format!("{}{}", self.base_url, path),
            reason: e.to_string(),
        })
    }

    /// The endpoint with the scheme switched to `ws`/`wss` for push sockets.
    pub fn socket_endpoint(&self, path: &str) -> Result<Url> {
        let mut url = self.endpoint(path)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| WizardError::InvalidUrl {
            url: url.to_string(),
            reason: format!("cannot switch scheme to {scheme}"),
        })?;
        Ok(url)
    }

    fn timed_out(&self, path: &str) -> WizardError {
        WizardError::Timeout {
            endpoint: path.to_string(),
            after: self.request_timeout,
        }
    }

    /// Send a request and insist on a 2xx answer.
    async fn send(&self, path: &str, request: RequestBuilder) -> Result<Response> {
        let response = timeout(self.request_timeout, request.send())
            .await
            .map_err(|_| self.timed_out(path))?
            .map_err(|e| WizardError::from_reqwest(path, e))?;
        let status = response.status();
        if !status.is_success() {
            debug!("api: {} answered {}", path, status);
            return Err(WizardError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(&self, path: &str, request: RequestBuilder) -> Result<T> {
        let response = self.send(path, request).await?;
        timeout(self.request_timeout, response.json::<T>())
            .await
            .map_err(|_| self.timed_out(path))?
            .map_err(|e| WizardError::Protocol {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        self.decode(path, self.client.get(url)).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        self.decode(path, self.client.post(url).json(body)).await
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        self.decode(path, self.client.post(url)).await
    }

    #[tracing::instrument(skip(self, token))]
    pub async fn check_token(&self, token: &str) -> Result<bool> {
        self.post_json(paths::CHECK_TOKEN, &json!({ "token": token }))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn submit_configuration(
        &self,
        config: &ConfigurationRequest,
    ) -> Result<StatusResponse> {
        self.post_json(paths::CONFIGURE, config).await
    }

    /// One of the four connectivity probes behind the health-check page.
    #[tracing::instrument(skip(self))]
    pub async fn check_status(&self, key: CheckKey) -> Result<StatusResponse> {
        let path = match key {
            CheckKey::Api => paths::CHECK_API,
            CheckKey::Webdav => paths::CHECK_WEBDAV,
            CheckKey::Ldap => paths::CHECK_LDAP,
            CheckKey::LdapAccess => paths::CHECK_LDAP_ACCESS,
        };
        self.get_json(path).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_admin_group(&self, admin_group: &str) -> Result<StatusResponse> {
        self.post_json(
            paths::SET_ADMIN_GROUP,
            &json!({ "admin_group": admin_group }),
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_self_signed_certificate(
        &self,
        request: &SelfSignedCertificateRequest,
    ) -> Result<StatusResponse> {
        self.post_json(paths::CREATE_SS_CERTIFICATE, request).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_lets_encrypt_certificate(
        &self,
        request: &LetsEncryptCertificateRequest,
    ) -> Result<LetsEncryptCertificateResponse> {
        self.post_json(paths::CREATE_LE_CERTIFICATE, request).await
    }

    #[tracing::instrument(skip(self, cert, key))]
    pub async fn upload_certificate(&self, cert: Vec<u8>, key: Vec<u8>) -> Result<StatusResponse> {
        let url = self.endpoint(paths::UPLOAD_CERTIFICATE)?;
        let form = Form::new()
            .part("cert", Part::bytes(cert).file_name("cert.pem"))
            .part("key", Part::bytes(key).file_name("key.pem"));
        self.decode(
            paths::UPLOAD_CERTIFICATE,
            self.client.post(url).multipart(form),
        )
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn proxy_check(&self) -> Result<ProxyCheckResponse> {
        self.get_json(paths::PROXY_CHECK).await
    }

    /// Ask the backend to write the final configuration and restart.
    #[tracing::instrument(skip(self))]
    pub async fn finish(&self) -> Result<StatusResponse> {
        self.post_empty(paths::FINISH).await
    }

    /// Tell the temporary setup backend to terminate.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown_installer(&self) -> Result<StatusResponse> {
        self.post_empty(paths::SHUTDOWN).await
    }

    /// Start the remote bootstrap. The response is handed back untouched: with
    /// a chunked backend its body is the progress feed itself.
    #[tracing::instrument(skip(self))]
    pub async fn start_bootstrap(&self, ssh: &SshConnection) -> Result<Response> {
        let url = self.endpoint(paths::LMN_BOOTSTRAP)?;
        self.send(paths::LMN_BOOTSTRAP, self.client.post(url).json(ssh))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn lmn_health(&self) -> Result<StatusResponse> {
        self.get_json(paths::LMN_HEALTH).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn check_lmn_connection(&self, host: &str) -> Result<StatusResponse> {
        self.post_json(paths::LMN_CHECK_CONNECTION, &json!({ "host": host }))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn lmn_requirements(&self, playbook: &str) -> Result<RequirementsResponse> {
        self.get_json(&paths::lmn_requirements(playbook)).await
    }

    #[tracing::instrument(skip(self, extra_vars))]
    pub async fn start_lmn_playbook(
        &self,
        playbook: &str,
        extra_vars: Map<String, Value>,
    ) -> Result<PlaybookStartResponse> {
        let request = PlaybookStartRequest {
            variables: PlaybookVariables { extra_vars },
        };
        self.post_json(&paths::lmn_playbook_start(playbook), &request)
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn edulution_config(&self) -> Result<EdulutionConfig> {
        self.get_json(paths::LMN_EDULUTION_CONFIG).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn shutdown_lmn_installer(&self) -> Result<StatusResponse> {
        self.post_empty(paths::LMN_SHUTDOWN).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_resolved_against_base() -> Result<()> {
        let base = Url::parse("https://installer.school.lan:8000/").unwrap();
        let api = InstallerApi::new(base)?;
        assert_eq!(
            "https://installer.school.lan:8000/api/lmn/bootstrap",
            api.endpoint(paths::LMN_BOOTSTRAP)?.as_str()
        );
        assert_eq!(
            "wss://installer.school.lan:8000/ws/lmn/output",
            api.socket_endpoint(paths::LMN_OUTPUT_SOCKET)?.as_str()
        );
        Ok(())
    }
}
