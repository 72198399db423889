//! Acceptance checks for replacement candidates

use crate::error::TransactionError;
use crate::models::{ReferenceEntry, ReplacementCandidate};
use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr};

/// Required-field check (step (a) of a replacement)
pub fn check_required_fields(candidate: &ReplacementCandidate) -> Result<(), TransactionError> {
    if candidate.url.trim().is_empty() {
        return Err(TransactionError::InvalidCandidate("missing url".to_string()));
    }
    if candidate.title.trim().is_empty() {
        return Err(TransactionError::InvalidCandidate("missing title".to_string()));
    }
    Ok(())
}

/// Rejects malformed, local, blocked and no-op candidate URLs
#[derive(Debug, Clone, Default)]
pub struct AcceptanceChecks {
    blocked_domains: Vec<String>,
}

impl AcceptanceChecks {
    pub fn new(blocked_domains: &[String]) -> Self {
        Self {
            blocked_domains: blocked_domains
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    pub fn check(
        &self,
        original: &ReferenceEntry,
        candidate: &ReplacementCandidate,
    ) -> Result<(), TransactionError> {
        let url = Url::parse(candidate.url.trim())
            .map_err(|e| TransactionError::Rejected(format!("malformed url {}: {}", candidate.url, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(TransactionError::Rejected(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransactionError::Rejected(format!("url {} has no host", candidate.url)))?
            .to_lowercase();

        if is_local_host(&host) {
            return Err(TransactionError::Rejected(format!("local address {}", host)));
        }

        if let Some(domain) = self.blocked_domain(&host) {
            return Err(TransactionError::Rejected(format!("blocked domain {}", domain)));
        }

        if normalize_url(&candidate.url) == normalize_url(&original.url) {
            return Err(TransactionError::Rejected(
                "candidate is the same source as the original".to_string(),
            ));
        }

        Ok(())
    }

    fn blocked_domain(&self, host: &str) -> Option<&str> {
        self.blocked_domains
            .iter()
            .find(|domain| host == domain.as_str() || host.ends_with(&format!(".{}", domain)))
            .map(String::as_str)
    }
}

fn is_local_host(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local") {
        return true;
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => is_local_v4(ip),
        // IPv4-mapped addresses are judged by the address they carry
        Ok(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
            Some(mapped) => is_local_v4(mapped),
            None => {
                let first = ip.segments()[0];
                ip.is_loopback()
                    || ip.is_unspecified()
                    || (first & 0xfe00) == 0xfc00 // unique local
                    || (first & 0xffc0) == 0xfe80 // link local
            }
        },
        Err(_) => false,
    }
}

fn is_local_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_unspecified()
        || ip.is_link_local()
        || ip.is_broadcast()
        || (a == 100 && (b & 0xc0) == 64) // shared address space 100.64.0.0/10
}

/// Comparable form of a URL: no fragment, no trailing slash, lowercase host
fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => raw.trim().trim_end_matches('/').to_lowercase(),
    }
}
