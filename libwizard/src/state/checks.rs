use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::StatusResponse;

/// Shown for a probe that never got an answer.
pub const CONNECTION_ERROR: &str = "Connection error!";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CheckKey {
    Api,
    Webdav,
    Ldap,
    LdapAccess,
}

impl CheckKey {
    pub const ALL: [CheckKey; 4] = [
        CheckKey::Api,
        CheckKey::Webdav,
        CheckKey::Ldap,
        CheckKey::LdapAccess,
    ];
}

impl fmt::Display for CheckKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckKey::Api => "api",
            CheckKey::Webdav => "webdav",
            CheckKey::Ldap => "ldap",
            CheckKey::LdapAccess => "ldapAccess",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub status: bool,
    pub message: String,
}

impl CheckResult {
    pub fn passed<S: Into<String>>(message: S) -> Self {
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

    pub fn connection_error() -> Self {
        Self::failed(CONNECTION_ERROR)
    }
}

impl From<StatusResponse> for CheckResult {
    fn from(response: StatusResponse) -> Self {
        Self {
            status: response.status,
            message: response.message,
        }
    }
}

/// Latest result and in-flight flag per check. A key without a result has not
/// been run yet (or was reset).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksState {
    results: BTreeMap<CheckKey, CheckResult>,
    loading: BTreeSet<CheckKey>,
}

impl ChecksState {
    pub fn result(&self, key: CheckKey) -> Option<&CheckResult> {
        self.results.get(&key)
    }

    pub fn is_loading(&self, key: CheckKey) -> bool {
        self.loading.contains(&key)
    }

    pub fn any_loading(&self) -> bool {
        !self.loading.is_empty()
    }

    /// True iff every known check has a present, passing result.
    pub fn all_passed(&self) -> bool {
        CheckKey::ALL
            .iter()
            .all(|key| self.results.get(key).is_some_and(|result| result.status))
    }

    pub(crate) fn set_result(&mut self, key: CheckKey, result: CheckResult) {
        self.results.insert(key, result);
    }

    pub(crate) fn set_loading(&mut self, key: CheckKey, loading: bool) {
        if loading {
            self.loading.insert(key);
        } else {
            self.loading.remove(&key);
        }
    }

    pub(crate) fn clear_results(&mut self) {
        self.results.clear();
    }
}
