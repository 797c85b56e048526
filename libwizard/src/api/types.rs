//! Wire types exchanged with the installer backend.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, WizardError};
use crate::log::redact;

/// The `{status, message}` envelope most backend calls answer with.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: bool,
    #[serde(default)]
    pub message: String,
}

impl StatusResponse {
    pub fn ok<S: Into<String>>(message: S) -> Self {
        Self {
            status: true,
            message: message.into(),
        }
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            status: false,
            message: message.into(),
        }
    }

    /// Turn `status: false` into an application error.
    pub fn into_result(self, endpoint: &str) -> Result<Self> {
        if self.status {
            Ok(self)
        } else {
            Err(WizardError::Application {
                endpoint: endpoint.to_string(),
                message: self.message,
            })
        }
    }
}

pub fn default_ssh_port() -> u16 {
    22
}

pub fn default_ssh_user() -> String {
    "root".into()
}

/// Credentials for the one-shot bootstrap of a fresh linuxmuster.net server.
/// Held in memory only; never written anywhere by this crate.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshConnection {
    pub host: String,
    #[serde(default = "self::default_ssh_port")]
    pub port: u16,
    #[serde(default = "self::default_ssh_user")]
    pub user: String,
    pub password: String,
}

impl SshConnection {
    pub fn new<S: Into<String>>(host: S, port: u16, user: S, password: S) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
        }
    }

    /// Port 0 is rejected; every other `u16` is a valid SSH port.
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty()
            && self.port > 0
            && !self.user.trim().is_empty()
            && !self.password.trim().is_empty()
    }
}

impl fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &redact(&self.password))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequirementStatus {
    Passed,
    Failed,
    Skipped,
}

/// A single server-side requirement evaluation. Display-only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RequirementCheck {
    pub name: String,
    pub status: RequirementStatus,
    #[serde(default)]
    pub required: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiskInfo {
    pub name: String,
    pub size_gb: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub ram_gb: Option<f64>,
    #[serde(default)]
    pub disks: Vec<DiskInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RequirementsResponse {
    pub playbook: String,
    pub all_passed: bool,
    #[serde(default)]
    pub checks: Vec<RequirementCheck>,
    #[serde(default)]
    pub system_info: SystemInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybookStartResponse {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct PlaybookVariables {
    pub extra_vars: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct PlaybookStartRequest {
    pub variables: PlaybookVariables,
}

/// Bind credentials generated on the linuxmuster.net server by the install
/// playbook.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdulutionConfig {
    pub binduser_dn: String,
    pub binduser_password: String,
}

impl fmt::Debug for EdulutionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdulutionConfig")
            .field("binduser_dn", &self.binduser_dn)
            .field("binduser_password", &redact(&self.binduser_password))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentTarget {
    Linuxmuster,
    Generic,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LdapSchema {
    Ldap,
    #[default]
    Ldaps,
}

/// Body of `POST /api/configure`. Field names follow the backend's camelCase.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationRequest {
    pub deployment_target: DeploymentTarget,
    pub lmn_external_domain: String,
    pub lmn_binduser_dn: String,
    pub lmn_binduser_pw: String,
    pub lmn_ldap_schema: LdapSchema,
    pub lmn_ldap_port: u16,
    pub edulution_external_domain: String,
}

impl fmt::Debug for ConfigurationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationRequest")
            .field("deployment_target", &self.deployment_target)
            .field("lmn_external_domain", &self.lmn_external_domain)
            .field("lmn_binduser_dn", &self.lmn_binduser_dn)
            .field("lmn_binduser_pw", &redact(&self.lmn_binduser_pw))
            .field("lmn_ldap_schema", &self.lmn_ldap_schema)
            .field("lmn_ldap_port", &self.lmn_ldap_port)
            .field("edulution_external_domain", &self.edulution_external_domain)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelfSignedCertificateRequest {
    pub countrycode: String,
    pub state: String,
    pub city: String,
    pub organisation: String,
    pub valid_days: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LetsEncryptCertificateRequest {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_provider: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcmeDnsRegistration {
    pub username: String,
    pub password: String,
    pub fulldomain: String,
    pub subdomain: String,
    #[serde(default)]
    pub allowfrom: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LetsEncryptCertificateResponse {
    pub status: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub registration: Option<AcmeDnsRegistration>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyCheckResponse {
    #[serde(rename = "proxyDetected")]
    pub proxy_detected: bool,
}
