//! Trust rule persistence
//!
//! Stores never cache: every lookup goes to the backing medium, and every
//! update is written before `set_rule` returns. Concurrent writers are not
//! coordinated; the last complete write wins.

use super::rule::{normalize_host, TrustRule};
use crate::tls::CertErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Trust store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed trust store {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Trust store unavailable: {0}")]
    Unavailable(String),
}

/// Durable mapping from (thumbprint, host) to a [`TrustRule`]
pub trait TrustRuleStore: Send + Sync {
    /// Look up the rule for a certificate on a host; expired rules are absent
    fn rule(&self, thumbprint: &str, host: &str) -> Result<Option<TrustRule>, StoreError>;

    /// Persist `rule`, replacing any rule for the same pair
    fn set_rule(&self, rule: &TrustRule) -> Result<(), StoreError>;

    /// Forget the rule for a pair; missing rules are not an error
    fn remove_rule(&self, thumbprint: &str, host: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRule {
    expiry: DateTime<Utc>,
    errors: Vec<u8>,
}

/// thumbprint -> host -> rule
type StoredRules = BTreeMap<String, BTreeMap<String, StoredRule>>;

impl StoredRule {
    fn from_rule(rule: &TrustRule) -> Self {
        StoredRule {
            expiry: rule.expiry(),
            errors: rule.ignored_errors().iter().map(|k| k.code()).collect(),
        }
    }

    fn into_rule(self, thumbprint: &str, host: &str) -> TrustRule {
        let mut rule = TrustRule::new(thumbprint, host, self.expiry);
        rule.set_ignored_errors(self.errors.into_iter().filter_map(CertErrorKind::from_code));
        rule
    }
}

/// JSON file backed store
#[derive(Debug, Clone)]
pub struct JsonRuleStore {
    path: PathBuf,
}

impl JsonRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonRuleStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> Result<StoredRules, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StoredRules::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        if text.trim().is_empty() {
            return Ok(StoredRules::new());
        }

        serde_json::from_str(&text).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, rules: &StoredRules) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(rules).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
        }

        // Write beside the target and rename so readers never see a torn file
        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(format!(".tmp{}", std::process::id()));
        let tmp_path = PathBuf::from(tmp_name);

        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };

        write().map_err(|e| {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                debug!(path = %tmp_path.display(), error = %cleanup, "temporary trust file not removed");
            }
            self.io_error(e)
        })
    }

    fn prune_expired(rules: &mut StoredRules, now: DateTime<Utc>) {
        for hosts in rules.values_mut() {
            hosts.retain(|_, stored| stored.expiry > now);
        }
        rules.retain(|_, hosts| !hosts.is_empty());
    }
}

impl TrustRuleStore for JsonRuleStore {
    fn rule(&self, thumbprint: &str, host: &str) -> Result<Option<TrustRule>, StoreError> {
        let host = normalize_host(host);
        let mut rules = self.load()?;

        let stored = match rules.get_mut(thumbprint).and_then(|hosts| hosts.remove(&host)) {
            Some(stored) => stored,
            None => return Ok(None),
        };

        let rule = stored.into_rule(thumbprint, &host);
        if rule.is_expired() {
            debug!(host, "ignoring expired trust rule");
            return Ok(None);
        }
        Ok(Some(rule))
    }

    fn set_rule(&self, rule: &TrustRule) -> Result<(), StoreError> {
        // Only a file that was read and failed to parse may be replaced
        let mut rules = match self.load() {
            Ok(rules) => rules,
            Err(e @ StoreError::Json { .. }) => {
                warn!(error = %e, "discarding malformed trust store");
                StoredRules::new()
            }
            Err(e) => return Err(e),
        };
        Self::prune_expired(&mut rules, Utc::now());

        rules
            .entry(rule.thumbprint().to_string())
            .or_default()
            .insert(rule.host().to_string(), StoredRule::from_rule(rule));

        self.save(&rules)?;
        debug!(host = rule.host(), expiry = %rule.expiry(), "stored trust rule");
        Ok(())
    }

    fn remove_rule(&self, thumbprint: &str, host: &str) -> Result<(), StoreError> {
        let host = normalize_host(host);
        let mut rules = self.load()?;

        let removed = rules
            .get_mut(thumbprint)
            .map(|hosts| hosts.remove(&host).is_some())
            .unwrap_or(false);
        if !removed {
            return Ok(());
        }

        rules.retain(|_, hosts| !hosts.is_empty());
        self.save(&rules)
    }
}

/// In-process store with the same semantics as [`JsonRuleStore`]
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: Mutex<HashMap<(String, String), TrustRule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rules, expired ones included
    pub fn len(&self) -> usize {
        self.rules.lock().map(|rules| rules.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("rule map lock poisoned".to_string())
    }
}

impl TrustRuleStore for MemoryRuleStore {
    fn rule(&self, thumbprint: &str, host: &str) -> Result<Option<TrustRule>, StoreError> {
        let rules = self.rules.lock().map_err(|_| Self::poisoned())?;
        let key = (thumbprint.to_string(), normalize_host(host));
        Ok(rules.get(&key).filter(|rule| !rule.is_expired()).cloned())
    }

    fn set_rule(&self, rule: &TrustRule) -> Result<(), StoreError> {
        let mut rules = self.rules.lock().map_err(|_| Self::poisoned())?;
        let key = (rule.thumbprint().to_string(), rule.host().to_string());
        rules.insert(key, rule.clone());
        Ok(())
    }

    fn remove_rule(&self, thumbprint: &str, host: &str) -> Result<(), StoreError> {
        let mut rules = self.rules.lock().map_err(|_| Self::poisoned())?;
        rules.remove(&(thumbprint.to_string(), normalize_host(host)));
        Ok(())
    }
}
