//! Input validation shared across ingestion paths: SSRF protection for
//! URL-sourced documents and filename sanitization for stored blobs.
//!
//! Both are `ValidationError`s, not transient failures (spec.md §7): a
//! blocked URL or an oversized filename will never succeed on retry.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid URL scheme '{0}', only http and https are allowed")]
    InvalidScheme(String),
    #[error("URL must include a hostname")]
    MissingHostname,
    #[error("blocked hostname: {0}")]
    BlockedHostname(String),
    #[error("blocked internal domain pattern '{0}' in hostname '{1}'")]
    BlockedDomainPattern(String, String),
    #[error("failed to resolve hostname: {0}")]
    ResolutionFailed(String),
    #[error("URL resolves to a private or internal IP address: {0}")]
    PrivateIp(IpAddr),
}

const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "::1",
    "0.0.0.0",
    "metadata.google.internal",
    "169.254.169.254",
    "metadata.azure.internal",
];

const BLOCKED_DOMAIN_SUFFIXES: &[&str] = &[".internal", ".local", ".localhost", ".corp", ".lan"];

/// True if `ip` is private, loopback, link-local, reserved, multicast, or
/// unspecified — any range a server-side fetch must never be allowed to
/// reach.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || v4.octets()[0] == 0
                || is_v4_reserved(v4)
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // unique local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

fn is_v4_reserved(v4: Ipv4Addr) -> bool {
    // 240.0.0.0/4 "reserved for future use", matching Python ipaddress'
    // IPv4Address.is_reserved.
    v4.octets()[0] >= 240
}

/// Validate a URL before the ingestion pipeline is allowed to fetch it.
/// Checks scheme, hostname blocklist, internal-domain suffixes, and the
/// resolved IP address(es), in that order.
pub fn validate_url_for_ssrf(raw_url: &str) -> Result<(), ValidationError> {
    let parsed = Url::parse(raw_url).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(ValidationError::InvalidScheme(scheme.to_string()));
    }

    let hostname = parsed
        .host_str()
        .ok_or(ValidationError::MissingHostname)?
        .to_string();
    let hostname_lower = hostname.to_lowercase();

    if BLOCKED_HOSTNAMES.contains(&hostname_lower.as_str()) {
        return Err(ValidationError::BlockedHostname(hostname));
    }

    for suffix in BLOCKED_DOMAIN_SUFFIXES {
        if hostname_lower.ends_with(suffix) {
            return Err(ValidationError::BlockedDomainPattern(
                suffix.to_string(),
                hostname,
            ));
        }
    }

    // If the host is already a literal IP, validate it directly without a
    // DNS round trip.
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(ValidationError::PrivateIp(ip));
        }
        return Ok(());
    }

    let lookup_target = format!("{}:0", hostname);
    let resolved: Vec<SocketAddr> = lookup_target
        .to_socket_addrs()
        .map_err(|e| ValidationError::ResolutionFailed(e.to_string()))?
        .collect();

    if resolved.is_empty() {
        return Err(ValidationError::ResolutionFailed(format!(
            "no addresses found for {hostname}"
        )));
    }

    for addr in resolved {
        if is_private_ip(addr.ip()) {
            return Err(ValidationError::PrivateIp(addr.ip()));
        }
    }

    Ok(())
}

const DANGEROUS_FILENAME_CHARS: &[char] =
    &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '\0'];
const MAX_FILENAME_LEN: usize = 255;

/// Sanitize a filename for safe blob storage: replaces dangerous
/// characters with `_`, trims leading/trailing dots and spaces, and caps
/// length while preserving the extension (spec.md §4.1).
pub fn sanitize_filename(filename: &str) -> String {
    let mut safe: String = filename
        .chars()
        .map(|c| {
            if DANGEROUS_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    safe = safe.trim_matches(|c| c == '.' || c == ' ').to_string();

    if safe.is_empty() {
        return "unnamed_file".to_string();
    }

    if safe.len() > MAX_FILENAME_LEN {
        if let Some(dot) = safe.rfind('.') {
            let (name, ext) = safe.split_at(dot);
            let ext = &ext[1..]; // drop the leading dot
            let max_name_len = MAX_FILENAME_LEN.saturating_sub(ext.len() + 1);
            let truncated_name = truncate_at_char_boundary(name, max_name_len);
            safe = format!("{truncated_name}.{ext}");
        } else {
            safe = truncate_at_char_boundary(&safe, MAX_FILENAME_LEN);
        }
    }

    safe
}

fn truncate_at_char_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_scheme() {
        let err = validate_url_for_ssrf("ftp://example.com/file").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidScheme(_)));
    }

    #[test]
    fn rejects_blocked_hostname() {
        let err = validate_url_for_ssrf("http://localhost/admin").unwrap_err();
        assert!(matches!(err, ValidationError::BlockedHostname(_)));
    }

    #[test]
    fn rejects_metadata_ip() {
        let err = validate_url_for_ssrf("http://169.254.169.254/latest/meta-data").unwrap_err();
        assert!(matches!(err, ValidationError::PrivateIp(_)));
    }

    #[test]
    fn rejects_internal_domain_suffix() {
        let err = validate_url_for_ssrf("https://db.corp/reports").unwrap_err();
        assert!(matches!(err, ValidationError::BlockedDomainPattern(_, _)));
    }

    #[test]
    fn rejects_private_literal_ip() {
        let err = validate_url_for_ssrf("http://10.0.0.5/data").unwrap_err();
        assert!(matches!(err, ValidationError::PrivateIp(_)));
    }

    #[test]
    fn is_private_ip_flags_standard_ranges() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.1.2.3".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.1.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn sanitize_filename_replaces_dangerous_chars() {
        assert_eq!(
            sanitize_filename("weird<>name:/\\|?*.pdf"),
            "weird______name_.pdf"
        );
    }

    #[test]
    fn sanitize_filename_trims_dots_and_spaces() {
        assert_eq!(sanitize_filename("  ..report.pdf.. "), "report.pdf");
    }

    #[test]
    fn sanitize_filename_empty_becomes_placeholder() {
        assert_eq!(sanitize_filename("..."), "unnamed_file");
    }

    #[test]
    fn sanitize_filename_caps_length_preserving_extension() {
        let long_name = format!("{}.pdf", "a".repeat(300));
        let sanitized = sanitize_filename(&long_name);
        assert!(sanitized.len() <= MAX_FILENAME_LEN);
        assert!(sanitized.ends_with(".pdf"));
    }
}
