//! Endpoint string parsing and DNS resolution.
//!
//! Configuration and DNS-seed hostnames arrive as strings of one of these
//! shapes: a bare hostname, `hostname:port`, `[ipv6]:port`, or a bare
//! `[ipv6]`. [`to_host_service`] splits them into host and service parts;
//! [`resolve`] turns them into socket endpoints, falling back to the
//! network's well-known port when no service is given.
//!
//! Resolution failures are never fatal: a name that does not resolve simply
//! yields no endpoints and the caller moves on.

use crate::network::Network;
use std::net::SocketAddr;
use tokio::net::lookup_host;
use tracing::debug;

/// Splits an endpoint string into host and service parts.
///
/// If the string begins with `[`, everything up to the matching `]` is the
/// host and a `:<port>` suffix (if present) is the service. Without
/// brackets, the split is at the first `:`; a string with nothing before
/// the first colon is kept whole as the host. An empty host is `None`.
pub fn to_host_service(s: &str) -> (Option<String>, Option<String>) {
    if let Some(rest) = s.strip_prefix('[') {
        match rest.find(']') {
            Some(end) => {
                let host = &rest[..end];
                let service = rest[end + 1..].strip_prefix(':').map(str::to_string);
                (non_empty(host), service)
            }
            None => (None, None),
        }
    } else {
        match s.find(':') {
            Some(0) => (non_empty(s), Some(String::new())),
            Some(i) => (non_empty(&s[..i]), Some(s[i + 1..].to_string())),
            None => (non_empty(s), None),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Resolves an endpoint string to zero or more socket endpoints.
///
/// A missing or empty service defaults to the network's well-known port.
/// The result is sorted and de-duplicated. Parse and lookup failures yield
/// an empty list.
pub async fn resolve(network: &Network, endpoint: &str) -> Vec<SocketAddr> {
    let (host, service) = to_host_service(endpoint);
    let Some(host) = host else {
        return Vec::new();
    };

    let port = match service.as_deref() {
        None | Some("") => network.default_port,
        Some(s) => match s.parse::<u16>() {
            Ok(p) => p,
            Err(_) => {
                debug!("Invalid service in endpoint {}: {}", endpoint, s);
                return Vec::new();
            }
        },
    };

    let result = lookup_host((host.as_str(), port)).await;
    match result {
        Ok(addrs) => {
            let mut endpoints: Vec<SocketAddr> = addrs.collect();
            endpoints.sort();
            endpoints.dedup();
            endpoints
        }
        Err(e) => {
            debug!("Failed to resolve {}: {}", endpoint, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::BTC;

    #[test]
    fn test_bracketed_ipv6_with_port() {
        assert_eq!(
            to_host_service("[::1]:8333"),
            (Some("::1".to_string()), Some("8333".to_string()))
        );
    }

    #[test]
    fn test_bracketed_ipv6_without_port() {
        assert_eq!(to_host_service("[::1]"), (Some("::1".to_string()), None));
    }

    #[test]
    fn test_bare_hostname() {
        assert_eq!(
            to_host_service("example.com"),
            (Some("example.com".to_string()), None)
        );
    }

    #[test]
    fn test_hostname_with_port() {
        assert_eq!(
            to_host_service("example.com:8333"),
            (Some("example.com".to_string()), Some("8333".to_string()))
        );
    }

    #[test]
    fn test_leading_colon_keeps_whole_string_as_host() {
        assert_eq!(
            to_host_service(":8333"),
            (Some(":8333".to_string()), Some(String::new()))
        );
    }

    #[test]
    fn test_empty_host_is_none() {
        assert_eq!(to_host_service(""), (None, None));
        assert_eq!(to_host_service("[]:8333"), (None, Some("8333".to_string())));
    }

    #[test]
    fn test_unterminated_bracket() {
        assert_eq!(to_host_service("[::1"), (None, None));
    }

    #[tokio::test]
    async fn test_resolve_ip_literal_with_port() {
        let endpoints = resolve(&BTC, "127.0.0.1:9000").await;
        assert_eq!(endpoints, vec!["127.0.0.1:9000".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_resolve_defaults_to_network_port() {
        let endpoints = resolve(&BTC, "127.0.0.1").await;
        assert_eq!(endpoints, vec!["127.0.0.1:8333".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_resolve_bad_service_is_empty() {
        assert!(resolve(&BTC, "127.0.0.1:notaport").await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_empty_host_is_empty() {
        assert!(resolve(&BTC, "").await.is_empty());
    }
}
