//! Certificate trust decision
//!
//! Runs after a successful handshake over the deferred verification errors:
//!
//! 1. errors without a certificate index are attached to the leaf
//! 2. a hostname mismatch is dropped when a leaf name wildcard-matches
//! 3. fatal errors reject immediately
//! 4. a stored, unexpired trust rule subtracts the errors it accepted
//! 5. without a UI the remaining errors reject
//! 6. otherwise the user decides, and an acceptance is persisted

use super::cert::PeerCertificate;
use super::domain;
use super::errors::{CertErrorKind, CertificateError};
use crate::interaction::{CertificateIssue, Durability, InteractionPort, IssueChoice};
use crate::trust::{TrustRule, TrustRuleStore};
use crate::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

/// Why a certificate was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A problem no rule or user decision can override
    Fatal(CertErrorKind),
    /// Problems remain and prompting is disabled
    NoUi,
    UserCancelled,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Fatal(kind) => write!(f, "fatal certificate error: {}", kind),
            RejectReason::NoUi => f.write_str("certificate not trusted and prompting is disabled"),
            RejectReason::UserCancelled => f.write_str("certificate refused by the user"),
        }
    }
}

/// Verdict of [`CertificateValidator::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// No problems at all
    Accepted,
    /// Every problem is covered by a stored rule
    AcceptedByRule,
    /// The user accepted the problems; a rule was stored
    AcceptedByUser(Durability),
    Rejected(RejectReason),
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, ValidationOutcome::Rejected(_))
    }

    /// Value published as `tls.action`
    pub fn action(&self) -> &'static str {
        if self.is_accepted() {
            "accept"
        } else {
            "reject"
        }
    }
}

/// Attach unindexed errors to the leaf and drop hostname mismatches that a
/// leaf wildcard pattern resolves
pub fn reconcile(host: &str, chain: &[PeerCertificate], errors: &[CertificateError]) -> Vec<CertificateError> {
    let host_matches = chain
        .first()
        .map(|leaf| leaf.domain_patterns().iter().any(|pattern| domain::matches(pattern, host)))
        .unwrap_or(false);

    let mut reconciled: Vec<CertificateError> = Vec::with_capacity(errors.len());
    for error in errors {
        let error = CertificateError::new(error.kind, Some(error.cert.unwrap_or(0)));
        if error.kind == CertErrorKind::HostNameMismatch && error.cert == Some(0) && host_matches {
            continue;
        }
        if !reconciled.contains(&error) {
            reconciled.push(error);
        }
    }
    reconciled
}

/// Decides whether a peer chain is trusted for a host
pub struct CertificateValidator<'a> {
    store: &'a dyn TrustRuleStore,
    port: &'a mut dyn InteractionPort,
    no_ui: bool,
}

impl<'a> CertificateValidator<'a> {
    pub fn new(store: &'a dyn TrustRuleStore, port: &'a mut dyn InteractionPort, no_ui: bool) -> Self {
        CertificateValidator { store, port, no_ui }
    }

    /// Validate `chain` (leaf first) for `host` given the handshake's raw errors
    pub fn validate(
        &mut self,
        host: &str,
        chain: &[PeerCertificate],
        errors: &[CertificateError],
    ) -> Result<ValidationOutcome> {
        let leaf = match chain.first() {
            Some(leaf) => leaf,
            None => {
                warn!(host, "peer presented no certificate");
                return Ok(ValidationOutcome::Rejected(RejectReason::Fatal(
                    CertErrorKind::NoPeerCertificate,
                )));
            }
        };

        let errors = reconcile(host, chain, errors);
        if errors.is_empty() {
            debug!(host, "certificate chain verified");
            return Ok(ValidationOutcome::Accepted);
        }

        if let Some(fatal) = errors.iter().find(|e| e.kind.is_fatal()) {
            warn!(host, error = %fatal, "fatal certificate error");
            return Ok(ValidationOutcome::Rejected(RejectReason::Fatal(fatal.kind)));
        }

        let thumbprint = leaf.thumbprint()?;
        let outstanding = match self.store.rule(&thumbprint, host) {
            Ok(Some(rule)) => rule.filter_errors(&errors),
            Ok(None) => errors,
            Err(e) => {
                warn!(host, error = %e, "trust rule lookup failed");
                errors
            }
        };
        if outstanding.is_empty() {
            info!(host, "certificate accepted by stored rule");
            return Ok(ValidationOutcome::AcceptedByRule);
        }

        if self.no_ui {
            info!(host, count = outstanding.len(), "untrusted certificate, prompting disabled");
            return Ok(ValidationOutcome::Rejected(RejectReason::NoUi));
        }

        let issue = CertificateIssue {
            host,
            errors: &outstanding,
            chain,
        };
        loop {
            match self.port.present_certificate_issue(&issue) {
                IssueChoice::ShowDetails => self.port.show_details(&issue),
                IssueChoice::Cancel => {
                    info!(host, "user refused certificate");
                    return Ok(ValidationOutcome::Rejected(RejectReason::UserCancelled));
                }
                IssueChoice::Continue => break,
            }
        }

        let durability = self.port.choose_durability(host);
        let mut rule = TrustRule::new(thumbprint, host, TrustRule::expiry_for(durability, Utc::now()));
        rule.set_ignored_errors(outstanding.iter().map(|e| e.kind));
        if let Err(e) = self.store.set_rule(&rule) {
            warn!(host, error = %e, "failed to persist trust rule");
        }

        info!(host, ?durability, "user accepted certificate");
        Ok(ValidationOutcome::AcceptedByUser(durability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::LeaveChoice;
    use crate::tls::cert::testing::{example_com, self_signed};
    use crate::trust::MemoryRuleStore;
    use chrono::Duration;

    /// Port that replays scripted answers and counts prompts
    #[derive(Default)]
    struct Scripted {
        answers: Vec<IssueChoice>,
        durability: Option<Durability>,
        prompts: usize,
        details: usize,
        last_errors: Vec<CertificateError>,
    }

    impl Scripted {
        fn answering(answers: &[IssueChoice], durability: Durability) -> Self {
            Scripted {
                answers: answers.iter().rev().copied().collect(),
                durability: Some(durability),
                ..Default::default()
            }
        }
    }

    impl InteractionPort for Scripted {
        fn present_certificate_issue(&mut self, issue: &CertificateIssue<'_>) -> IssueChoice {
            self.prompts += 1;
            self.last_errors = issue.errors.to_vec();
            self.answers.pop().unwrap_or(IssueChoice::Cancel)
        }

        fn show_details(&mut self, _issue: &CertificateIssue<'_>) {
            self.details += 1;
        }

        fn choose_durability(&mut self, _host: &str) -> Durability {
            self.durability.unwrap_or(Durability::SessionOnly)
        }

        fn confirm_leave_secure(&mut self, _host: &str) -> LeaveChoice {
            LeaveChoice::Cancel
        }
    }

    fn err(kind: CertErrorKind, cert: Option<usize>) -> CertificateError {
        CertificateError::new(kind, cert)
    }

    #[test]
    fn test_wildcard_drops_hostname_mismatch() {
        let chain = vec![example_com()];
        let errors = [err(CertErrorKind::HostNameMismatch, None)];

        assert!(reconcile("www.example.com", &chain, &errors).is_empty());
        assert!(reconcile("EXAMPLE.com.", &chain, &errors).is_empty());
        assert_eq!(
            reconcile("a.b.example.com", &chain, &errors),
            vec![err(CertErrorKind::HostNameMismatch, Some(0))]
        );
        assert_eq!(
            reconcile("example.org", &chain, &errors),
            vec![err(CertErrorKind::HostNameMismatch, Some(0))]
        );
    }

    #[test]
    fn test_backfill_attaches_to_leaf() {
        let chain = vec![example_com()];
        let errors = [
            err(CertErrorKind::SelfSignedCertificate, None),
            err(CertErrorKind::SelfSignedCertificate, Some(0)),
            err(CertErrorKind::ExpiredCertificate, Some(1)),
        ];
        assert_eq!(
            reconcile("example.com", &chain, &errors),
            vec![
                err(CertErrorKind::SelfSignedCertificate, Some(0)),
                err(CertErrorKind::ExpiredCertificate, Some(1)),
            ]
        );
    }

    #[test]
    fn test_clean_chain_accepted_without_prompt() {
        let store = MemoryRuleStore::new();
        let mut port = Scripted::default();
        let chain = vec![example_com()];

        let outcome = CertificateValidator::new(&store, &mut port, false)
            .validate("example.com", &chain, &[])
            .unwrap();
        assert_eq!(outcome, ValidationOutcome::Accepted);
        assert_eq!(port.prompts, 0);
    }

    #[test]
    fn test_expired_rule_does_not_apply() {
        // Stored rule covers the error but has lapsed, and there is no UI
        let store = MemoryRuleStore::new();
        let chain = vec![example_com()];
        let mut rule = TrustRule::new(chain[0].thumbprint().unwrap(), "host.example", Utc::now() - Duration::minutes(1));
        rule.set_ignored_errors([CertErrorKind::ExpiredCertificate]);
        store.set_rule(&rule).unwrap();

        let mut port = Scripted::default();
        let outcome = CertificateValidator::new(&store, &mut port, true)
            .validate("host.example", &chain, &[err(CertErrorKind::ExpiredCertificate, Some(0))])
            .unwrap();
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::NoUi));
        assert_eq!(port.prompts, 0);
    }

    #[test]
    fn test_accept_forever_persists_and_skips_next_prompt() {
        let store = MemoryRuleStore::new();
        let chain = vec![self_signed("internal.example", &["internal.example"])];
        let errors = [err(CertErrorKind::SelfSignedCertificate, Some(0))];

        let mut port = Scripted::answering(&[IssueChoice::Continue], Durability::Forever);
        let outcome = CertificateValidator::new(&store, &mut port, false)
            .validate("internal.example", &chain, &errors)
            .unwrap();
        assert_eq!(outcome, ValidationOutcome::AcceptedByUser(Durability::Forever));
        assert_eq!(port.prompts, 1);

        let rule = store
            .rule(&chain[0].thumbprint().unwrap(), "internal.example")
            .unwrap()
            .unwrap();
        assert_eq!(
            rule.ignored_errors().iter().copied().collect::<Vec<_>>(),
            vec![CertErrorKind::SelfSignedCertificate]
        );
        assert!(rule.expiry() - Utc::now() > Duration::days(365 * 999));

        let mut again = Scripted::default();
        let outcome = CertificateValidator::new(&store, &mut again, false)
            .validate("internal.example", &chain, &errors)
            .unwrap();
        assert_eq!(outcome, ValidationOutcome::AcceptedByRule);
        assert_eq!(again.prompts, 0);
    }

    #[test]
    fn test_rule_is_per_host() {
        let store = MemoryRuleStore::new();
        let chain = vec![self_signed("internal.example", &[])];
        let errors = [err(CertErrorKind::SelfSignedCertificate, Some(0))];

        let mut port = Scripted::answering(&[IssueChoice::Continue], Durability::SessionOnly);
        CertificateValidator::new(&store, &mut port, false)
            .validate("internal.example", &chain, &errors)
            .unwrap();

        let outcome = CertificateValidator::new(&store, &mut port, true)
            .validate("other.example", &chain, &errors)
            .unwrap();
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::NoUi));
    }

    #[test]
    fn test_partial_rule_prompts_for_remainder() {
        let store = MemoryRuleStore::new();
        let chain = vec![self_signed("internal.example", &[])];
        let mut rule = TrustRule::new(chain[0].thumbprint().unwrap(), "internal.example", Utc::now() + Duration::hours(1));
        rule.set_ignored_errors([CertErrorKind::SelfSignedCertificate]);
        store.set_rule(&rule).unwrap();

        let errors = [
            err(CertErrorKind::SelfSignedCertificate, Some(0)),
            err(CertErrorKind::ExpiredCertificate, Some(0)),
        ];
        let mut port = Scripted::answering(&[IssueChoice::Continue], Durability::SessionOnly);
        CertificateValidator::new(&store, &mut port, false)
            .validate("internal.example", &chain, &errors)
            .unwrap();
        assert_eq!(port.last_errors, vec![err(CertErrorKind::ExpiredCertificate, Some(0))]);

        // The new rule covers exactly what was outstanding
        let stored = store.rule(rule.thumbprint(), "internal.example").unwrap().unwrap();
        assert_eq!(
            stored.ignored_errors().iter().copied().collect::<Vec<_>>(),
            vec![CertErrorKind::ExpiredCertificate]
        );
        let session_limit = Utc::now() + Duration::minutes(31);
        assert!(stored.expiry() < session_limit);
    }

    #[test]
    fn test_fatal_error_skips_lookup_and_prompt() {
        let store = MemoryRuleStore::new();
        let chain = vec![example_com()];
        let errors = [
            err(CertErrorKind::ExpiredCertificate, Some(0)),
            err(CertErrorKind::RevokedCertificate, Some(0)),
        ];

        let mut port = Scripted::answering(&[IssueChoice::Continue], Durability::Forever);
        let outcome = CertificateValidator::new(&store, &mut port, false)
            .validate("example.com", &chain, &errors)
            .unwrap();
        assert_eq!(
            outcome,
            ValidationOutcome::Rejected(RejectReason::Fatal(CertErrorKind::RevokedCertificate))
        );
        assert_eq!(port.prompts, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_details_then_cancel() {
        let store = MemoryRuleStore::new();
        let chain = vec![example_com()];
        let errors = [err(CertErrorKind::UntrustedCertificate, Some(0))];

        let mut port = Scripted::answering(
            &[IssueChoice::ShowDetails, IssueChoice::ShowDetails, IssueChoice::Cancel],
            Durability::Forever,
        );
        let outcome = CertificateValidator::new(&store, &mut port, false)
            .validate("example.com", &chain, &errors)
            .unwrap();
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::UserCancelled));
        assert_eq!(port.prompts, 3);
        assert_eq!(port.details, 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_chain_is_fatal() {
        let store = MemoryRuleStore::new();
        let mut port = Scripted::default();
        let outcome = CertificateValidator::new(&store, &mut port, false)
            .validate("example.com", &[], &[])
            .unwrap();
        assert_eq!(
            outcome,
            ValidationOutcome::Rejected(RejectReason::Fatal(CertErrorKind::NoPeerCertificate))
        );
        assert_eq!(outcome.action(), "reject");
    }
}
