//! Trust rule type

use crate::interaction::Durability;
use crate::tls::{CertErrorKind, CertificateError};
use chrono::{DateTime, Duration, Months, Utc};
use std::collections::BTreeSet;

/// Lifetime of a rule accepted "forever"
pub const FOREVER_YEARS: u32 = 1000;

/// Lifetime of a rule accepted for the current session only
pub const SESSION_ONLY_MINUTES: i64 = 30;

/// Accepted certificate problems for one (certificate, host) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRule {
    thumbprint: String,
    host: String,
    ignored: BTreeSet<CertErrorKind>,
    expiry: DateTime<Utc>,
}

impl TrustRule {
    pub fn new(thumbprint: impl Into<String>, host: &str, expiry: DateTime<Utc>) -> Self {
        TrustRule {
            thumbprint: thumbprint.into(),
            host: normalize_host(host),
            ignored: BTreeSet::new(),
            expiry,
        }
    }

    /// Compute the expiry instant for a durability choice made at `now`
    pub fn expiry_for(durability: Durability, now: DateTime<Utc>) -> DateTime<Utc> {
        match durability {
            Durability::Forever => now
                .checked_add_months(Months::new(FOREVER_YEARS * 12))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Durability::SessionOnly => now
                .checked_add_signed(Duration::minutes(SESSION_ONLY_MINUTES))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    pub fn set_expiry(&mut self, expiry: DateTime<Utc>) {
        self.expiry = expiry;
    }

    pub fn ignored_errors(&self) -> &BTreeSet<CertErrorKind> {
        &self.ignored
    }

    /// Replace the accepted set; fatal kinds are never accepted
    pub fn set_ignored_errors<I>(&mut self, kinds: I)
    where
        I: IntoIterator<Item = CertErrorKind>,
    {
        self.ignored = kinds.into_iter().filter(|k| !k.is_fatal()).collect();
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Errors not covered by this rule
    pub fn filter_errors(&self, errors: &[CertificateError]) -> Vec<CertificateError> {
        errors
            .iter()
            .filter(|e| !self.ignored.contains(&e.kind))
            .copied()
            .collect()
    }
}

pub(crate) fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
