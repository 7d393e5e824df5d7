//! User interaction capability
//!
//! The connection layer never renders dialogs itself. Whatever front end the
//! worker talks to implements [`InteractionPort`] and is handed to the
//! connection at construction time.

use crate::tls::{CertificateError, PeerCertificate};

/// Answer to a certificate problem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueChoice {
    Continue,
    Cancel,
    ShowDetails,
}

/// How long an accepted certificate stays trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Forever,
    SessionOnly,
}

/// Answer to the "leaving secure mode" warning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveChoice {
    Continue,
    Cancel,
}

/// Everything shown to the user about an untrusted certificate
#[derive(Debug, Clone)]
pub struct CertificateIssue<'a> {
    pub host: &'a str,
    /// Problems that are still outstanding
    pub errors: &'a [CertificateError],
    /// Peer chain, leaf first
    pub chain: &'a [PeerCertificate],
}

impl CertificateIssue<'_> {
    /// One human-readable line per outstanding problem
    pub fn descriptions(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.kind.description().to_string()).collect()
    }

    /// Summary message for a prompt
    pub fn message(&self) -> String {
        let mut message = format!("The server failed the authenticity check ({}).\n\n", self.host);
        for line in self.descriptions() {
            message.push_str(&line);
            message.push('\n');
        }
        message.trim_end().to_string()
    }
}

/// Front end used for security decisions
pub trait InteractionPort {
    /// Ask whether to continue despite `issue`
    fn present_certificate_issue(&mut self, issue: &CertificateIssue<'_>) -> IssueChoice;

    /// Show certificate and error details; called after [`IssueChoice::ShowDetails`]
    fn show_details(&mut self, _issue: &CertificateIssue<'_>) {}

    /// Ask how long the accepted certificate should be trusted
    fn choose_durability(&mut self, host: &str) -> Durability;

    /// Warn that the next connection to `host` will not be encrypted
    fn confirm_leave_secure(&mut self, host: &str) -> LeaveChoice;
}

/// Non-interactive port: refuses every question
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

impl InteractionPort for RejectAll {
    fn present_certificate_issue(&mut self, _issue: &CertificateIssue<'_>) -> IssueChoice {
        IssueChoice::Cancel
    }

    fn choose_durability(&mut self, _host: &str) -> Durability {
        Durability::SessionOnly
    }

    fn confirm_leave_secure(&mut self, _host: &str) -> LeaveChoice {
        LeaveChoice::Cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::CertErrorKind;

    #[test]
    fn test_issue_message_lists_every_error() {
        let errors = [
            CertificateError::new(CertErrorKind::ExpiredCertificate, Some(0)),
            CertificateError::new(CertErrorKind::UntrustedCertificate, Some(1)),
        ];
        let issue = CertificateIssue {
            host: "example.com",
            errors: &errors,
            chain: &[],
        };

        let message = issue.message();
        assert!(message.contains("(example.com)"));
        assert!(message.contains("has expired"));
        assert!(message.ends_with("not trusted"));
        assert_eq!(issue.descriptions().len(), 2);
    }

    #[test]
    fn test_reject_all() {
        let mut port = RejectAll;
        let issue = CertificateIssue { host: "h", errors: &[], chain: &[] };
        assert_eq!(port.present_certificate_issue(&issue), IssueChoice::Cancel);
        assert_eq!(port.confirm_leave_secure("h"), LeaveChoice::Cancel);
    }
}
