//! Outbound delivery
//!
//! Recipients are grouped by domain; each domain is delivered independently and
//! its failure is recorded in the report under the domain name.

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use tidemail_common::types::{Email, EmailAddress};
use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Per-domain delivery failure
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("MX lookup failed: {0}")]
    Resolve(String),
    #[error("SMTP error: {0}")]
    Smtp(String),
}

/// Outcome of delivering one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Error text keyed by recipient domain
    pub errors: HashMap<String, String>,
}

impl DeliveryReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn record(&mut self, domain: impl Into<String>, error: impl ToString) {
        self.errors.insert(domain.into(), error.to_string());
    }

    /// Every error joined as `domain: text`, ordered by domain
    pub fn error_text(&self) -> String {
        let ordered: BTreeMap<_, _> = self.errors.iter().collect();
        ordered
            .into_iter()
            .map(|(domain, err)| format!("{}: {}", domain, err))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Seam between the send pipeline and the network
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Deliver a rendered message to every recipient of `email`
    async fn deliver(&self, email: &Email, raw: &[u8]) -> DeliveryReport;
}

/// Recipient addresses grouped by lowercased domain
pub fn group_by_domain(email: &Email) -> (BTreeMap<String, Vec<String>>, DeliveryReport) {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut report = DeliveryReport::default();

    for rcpt in email.all_recipients() {
        match EmailAddress::parse(&rcpt.address) {
            Some(addr) => {
                let entry = groups.entry(addr.domain.clone()).or_default();
                let full = addr.to_string();
                if !entry.contains(&full) {
                    entry.push(full);
                }
            }
            None => report.record(
                rcpt.address.clone(),
                DeliveryError::InvalidAddress(rcpt.address.clone()),
            ),
        }
    }

    (groups, report)
}

/// Direct-to-MX delivery over SMTP
pub struct SmtpDelivery {
    resolver: TokioAsyncResolver,
    port: u16,
    timeout: Duration,
}

impl SmtpDelivery {
    /// Delivery using the system resolver configuration
    pub fn from_system() -> anyhow::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self::new(resolver))
    }

    /// System resolver when readable, otherwise the resolver library defaults
    pub fn system_or_default() -> Self {
        Self::from_system().unwrap_or_else(|e| {
            warn!("System resolver configuration unavailable ({}), using defaults", e);
            Self::new(TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()))
        })
    }

    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self {
            resolver,
            port: 25,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// MX hosts for a domain ordered by preference, falling back to the domain itself
    async fn mx_hosts(&self, domain: &str) -> Result<Vec<String>, DeliveryError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut records: Vec<_> = lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect();
                records.sort_by_key(|(pref, _)| *pref);
                let hosts: Vec<String> = records
                    .into_iter()
                    .map(|(_, host)| host.trim_end_matches('.').to_string())
                    .filter(|host| !host.is_empty())
                    .collect();
                if hosts.is_empty() {
                    Ok(vec![domain.to_string()])
                } else {
                    Ok(hosts)
                }
            }
            Err(e) => {
                debug!(domain, "MX lookup failed, trying implicit MX: {}", e);
                if self.resolver.lookup_ip(domain).await.is_ok() {
                    Ok(vec![domain.to_string()])
                } else {
                    Err(DeliveryError::Resolve(e.to_string()))
                }
            }
        }
    }

    async fn deliver_domain(
        &self,
        domain: &str,
        envelope: &Envelope,
        raw: &[u8],
    ) -> Result<(), DeliveryError> {
        let hosts = self.mx_hosts(domain).await?;
        let mut last_error = DeliveryError::Resolve(format!("no MX hosts for {}", domain));

        for host in hosts {
            let tls = TlsParameters::new(host.clone())
                .map(Tls::Opportunistic)
                .unwrap_or(Tls::None);

            let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host.as_str())
                .port(self.port)
                .timeout(Some(self.timeout))
                .tls(tls)
                .build();

            match transport.send_raw(envelope, raw).await {
                Ok(_) => {
                    info!(domain, mx = %host, "Message delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(domain, mx = %host, "Delivery attempt failed: {}", e);
                    last_error = DeliveryError::Smtp(e.to_string());
                }
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl DeliveryTransport for SmtpDelivery {
    async fn deliver(&self, email: &Email, raw: &[u8]) -> DeliveryReport {
        let (groups, mut report) = group_by_domain(email);

        let sender_address = email
            .sender
            .as_ref()
            .map(|s| s.address.as_str())
            .unwrap_or(email.from.address.as_str());
        let from = match sender_address.parse::<Address>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                for domain in groups.keys() {
                    let error = DeliveryError::InvalidAddress(format!("{}: {}", sender_address, e));
                    report.record(domain.clone(), error);
                }
                return report;
            }
        };

        for (domain, recipients) in groups {
            let to: Result<Vec<Address>, _> =
                recipients.iter().map(|r| r.parse::<Address>()).collect();
            let envelope = match to
                .map_err(|e| DeliveryError::InvalidAddress(e.to_string()))
                .and_then(|to| {
                    Envelope::new(from.clone(), to)
                        .map_err(|e| DeliveryError::InvalidAddress(e.to_string()))
                })
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    report.record(domain, e);
                    continue;
                }
            };

            if let Err(e) = self.deliver_domain(&domain, &envelope, raw).await {
                report.record(domain, e);
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tidemail_common::types::Participant;

    #[test]
    fn test_group_by_domain() {
        let email = Email {
            to: vec![
                Participant::new("", "a@One.test"),
                Participant::new("", "b@one.test"),
            ],
            cc: vec![Participant::new("", "c@two.test")],
            bcc: vec![Participant::new("", "a@one.test"), Participant::new("", "broken")],
            ..Default::default()
        };

        let (groups, report) = group_by_domain(&email);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["one.test"], vec!["a@one.test".to_string(), "b@one.test".to_string()]);
        assert_eq!(groups["two.test"], vec!["c@two.test".to_string()]);
        assert!(report.errors.contains_key("broken"));
    }

    #[test]
    fn test_error_text_is_ordered() {
        let mut report = DeliveryReport::default();
        assert!(report.is_success());
        report.record("z.test", "refused");
        report.record("a.test", "timeout");
        assert!(!report.is_success());
        assert_eq!(report.error_text(), "a.test: timeout; z.test: refused");
    }
}
