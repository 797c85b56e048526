use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::{ConfigurationRequest, DeploymentTarget, EdulutionConfig, LdapSchema};
use crate::error::{Result, WizardError};
use crate::log::redact;

pub fn default_ldap_port() -> u16 {
    636
}

/// Domain, credential, ldap and certificate settings gathered across the
/// wizard pages.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfigurationBundle {
    pub deployment_target: Option<DeploymentTarget>,
    pub lmn_external_domain: String,
    pub lmn_binduser_dn: String,
    pub lmn_binduser_pw: String,
    pub lmn_ldap_schema: LdapSchema,
    pub lmn_ldap_port: u16,
    pub edulution_external_domain: String,
    pub initial_admin_group: String,
    pub certificate_configured: bool,
    pub proxy_detected: bool,
}

impl Default for ConfigurationBundle {
    fn default() -> Self {
        Self {
            deployment_target: None,
            lmn_external_domain: String::new(),
            lmn_binduser_dn: String::new(),
            lmn_binduser_pw: String::new(),
            lmn_ldap_schema: LdapSchema::default(),
            lmn_ldap_port: default_ldap_port(),
            edulution_external_domain: String::new(),
            initial_admin_group: String::new(),
            certificate_configured: false,
            proxy_detected: false,
        }
    }
}

impl ConfigurationBundle {
    /// Build the `POST /api/configure` body. Fails if no deployment target
    /// was chosen yet.
    pub fn to_request(&self) -> Result<ConfigurationRequest> {
        let deployment_target = self
            .deployment_target
            .ok_or_else(|| WizardError::Config("no deployment target selected".into()))?;
        Ok(ConfigurationRequest {
            deployment_target,
            lmn_external_domain: self.lmn_external_domain.clone(),
            lmn_binduser_dn: self.lmn_binduser_dn.clone(),
            lmn_binduser_pw: self.lmn_binduser_pw.clone(),
            lmn_ldap_schema: self.lmn_ldap_schema,
            lmn_ldap_port: self.lmn_ldap_port,
            edulution_external_domain: self.edulution_external_domain.clone(),
        })
    }

    pub fn apply_derived(&mut self, derived: &EdulutionConfig) {
        self.lmn_binduser_dn = derived.binduser_dn.clone();
        self.lmn_binduser_pw = derived.binduser_password.clone();
    }
}

impl fmt::Debug for ConfigurationBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationBundle")
            .field("deployment_target", &self.deployment_target)
            .field("lmn_external_domain", &self.lmn_external_domain)
            .field("lmn_binduser_dn", &self.lmn_binduser_dn)
            .field("lmn_binduser_pw", &redact(&self.lmn_binduser_pw))
            .field("lmn_ldap_schema", &self.lmn_ldap_schema)
            .field("lmn_ldap_port", &self.lmn_ldap_port)
            .field("edulution_external_domain", &self.edulution_external_domain)
            .field("initial_admin_group", &self.initial_admin_group)
            .field("certificate_configured", &self.certificate_configured)
            .field("proxy_detected", &self.proxy_detected)
            .finish()
    }
}

/// Network and school settings for a fresh linuxmuster.net server, passed to
/// the install playbook as `lmn_*` extra vars.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LmnConfig {
    pub server_ip: String,
    pub netmask: String,
    pub gateway: String,
    pub servername: String,
    pub domainname: String,
    pub schoolname: String,
    pub location: String,
    pub country: String,
    pub state: String,
    pub dhcprange: String,
    pub adminpw: String,
    pub timezone: String,
    pub locale: String,
}

impl Default for LmnConfig {
    fn default() -> Self {
        Self {
            server_ip: String::new(),
            netmask: String::new(),
            gateway: String::new(),
            servername: "server".into(),
            domainname: "linuxmuster.lan".into(),
            schoolname: String::new(),
            location: String::new(),
            country: "de".into(),
            state: String::new(),
            dhcprange: String::new(),
            adminpw: String::new(),
            timezone: "Europe/Berlin".into(),
            locale: "de_DE.UTF-8".into(),
        }
    }
}

impl LmnConfig {
    pub fn extra_vars(&self) -> Map<String, Value> {
        [
            ("lmn_server_ip", &self.server_ip),
            ("lmn_netmask", &self.netmask),
            ("lmn_gateway", &self.gateway),
            ("lmn_servername", &self.servername),
            ("lmn_domainname", &self.domainname),
            ("lmn_schoolname", &self.schoolname),
            ("lmn_location", &self.location),
            ("lmn_country", &self.country),
            ("lmn_state", &self.state),
            ("lmn_dhcprange", &self.dhcprange),
            ("lmn_adminpw", &self.adminpw),
            ("lmn_timezone", &self.timezone),
            ("lmn_locale", &self.locale),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), Value::String(value.clone())))
        .collect()
    }
}

impl fmt::Debug for LmnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmnConfig")
            .field("server_ip", &self.server_ip)
            .field("netmask", &self.netmask)
            .field("gateway", &self.gateway)
            .field("servername", &self.servername)
            .field("domainname", &self.domainname)
            .field("schoolname", &self.schoolname)
            .field("adminpw", &redact(&self.adminpw))
            .finish_non_exhaustive()
    }
}
