use regex::Regex;
use std::net::IpAddr;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid alias: {0}")]
    InvalidAlias(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;

// Dotted labels of alphanumerics with interior hyphens, final label at least
// two alphabetic characters. `localhost` is special-cased below.
static DOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,}$").unwrap()
});

// Alias slug: leading alphanumeric, then alphanumerics, `-` and `_`, 1-63 chars.
static ALIAS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,62}$").unwrap());

/// Domain suffixes the daemon refuses to override. Remapping these breaks
/// OS updates and code signing checks on the platforms we run on.
const BLOCKED_DOMAINS: &[&str] = &[
    "apple.com",
    "icloud.com",
    "icloud-content.com",
    "apple-dns.cn",
    "apple-dns.net",
    "mzstatic.com",
    "itunes.apple.com",
    "updates.apple.com",
];

/// Validates a host-file domain name.
///
/// Accepts conventional multi-label hostnames (`myapp.local`,
/// `api.staging.example.com`) and the literal `localhost`.
pub fn validate_domain(domain: &str) -> ValidationResult<()> {
    if domain.is_empty() {
        return Err(ValidationError::InvalidDomain(
            "domain cannot be empty".to_string(),
        ));
    }
    if domain == "localhost" || DOMAIN_REGEX.is_match(domain) {
        return Ok(());
    }
    Err(ValidationError::InvalidDomain(domain.to_string()))
}

/// Validates an IP address literal (IPv4 or IPv6).
pub fn validate_ip(ip: &str) -> ValidationResult<IpAddr> {
    ip.parse::<IpAddr>()
        .map_err(|_| ValidationError::InvalidIpAddress(ip.to_string()))
}

/// Validates an alias slug.
pub fn validate_alias(alias: &str) -> ValidationResult<()> {
    if ALIAS_REGEX.is_match(alias) {
        Ok(())
    } else {
        Err(ValidationError::InvalidAlias(alias.to_string()))
    }
}

/// Returns true if the domain equals a blocklist entry or is a dotted
/// subdomain of one. Matching is case-insensitive.
pub fn is_blocked_domain(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    BLOCKED_DOMAINS.iter().any(|blocked| {
        domain == *blocked || domain.ends_with(&format!(".{blocked}"))
    })
}

/// The blocklist, for diagnostics.
pub fn blocked_domains() -> &'static [&'static str] {
    BLOCKED_DOMAINS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_domains() {
        assert!(validate_domain("localhost").is_ok());
        assert!(validate_domain("myapp.local").is_ok());
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("sub.domain.example.com").is_ok());
        assert!(validate_domain("my-server.dev").is_ok());
        assert!(validate_domain("123.example.io").is_ok());
    }

    #[test]
    fn test_invalid_domains() {
        assert!(validate_domain("").is_err());
        assert!(validate_domain("no-dots").is_err());
        assert!(validate_domain("-leading.hyphen.com").is_err());
        assert!(validate_domain("trailing-.hyphen.com").is_err());
        assert!(validate_domain("ends.in.digits.123").is_err());
        assert!(validate_domain("under_score.com").is_err());
        assert!(validate_domain("double..dot.com").is_err());
        assert!(validate_domain("spaces in.domain.com").is_err());
    }

    #[test]
    fn test_domain_label_length() {
        let max_label = "a".repeat(63);
        assert!(validate_domain(&format!("{max_label}.com")).is_ok());

        let too_long = "a".repeat(64);
        assert!(validate_domain(&format!("{too_long}.com")).is_err());
    }

    #[test]
    fn test_valid_ips() {
        assert!(validate_ip("127.0.0.1").is_ok());
        assert!(validate_ip("10.0.0.1").is_ok());
        assert!(validate_ip("255.255.255.255").is_ok());
        assert!(validate_ip("::1").is_ok());
        assert!(validate_ip("fe80::1").is_ok());
        assert!(validate_ip("2001:0db8:85a3::8a2e:0370:7334").is_ok());
    }

    #[test]
    fn test_invalid_ips() {
        assert!(validate_ip("").is_err());
        assert!(validate_ip("256.1.1.1").is_err());
        assert!(validate_ip("192.168.1").is_err());
        assert!(validate_ip("not-an-ip").is_err());
        assert!(validate_ip("gggg::1").is_err());
    }

    #[test]
    fn test_valid_aliases() {
        assert!(validate_alias("x").is_ok());
        assert!(validate_alias("myapp-local").is_ok());
        assert!(validate_alias("my_app2").is_ok());
        assert!(validate_alias("0day").is_ok());
        assert!(validate_alias(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_invalid_aliases() {
        assert!(validate_alias("").is_err());
        assert!(validate_alias("-leading").is_err());
        assert!(validate_alias("_leading").is_err());
        assert!(validate_alias("has space").is_err());
        assert!(validate_alias("has.dot").is_err());
        assert!(validate_alias(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_blocked_domains() {
        assert!(is_blocked_domain("apple.com"));
        assert!(is_blocked_domain("APPLE.COM"));
        assert!(is_blocked_domain("updates.apple.com"));
        assert!(is_blocked_domain("cdn.icloud.com"));

        assert!(!is_blocked_domain("apple.com.evil.example"));
        assert!(!is_blocked_domain("notapple.com"));
        assert!(!is_blocked_domain("myapp.local"));
    }

    #[test]
    fn test_blocklist_is_exposed() {
        assert!(blocked_domains().contains(&"icloud.com"));
    }
}
