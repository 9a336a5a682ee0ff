use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;
use url::{Host, Url};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("url has no host component")]
    NoHost,
    #[error("dns lookup for '{host}' failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no non-loopback IPv4 address found for '{0}'")]
    NoIpv4(String),
}

/// Whether the URL's host is a bare hostname rather than an IP literal.
/// Unparsable input counts as "not a hostname" so callers never attempt a
/// dual-send on garbage.
pub fn is_hostname(url_str: &str) -> bool {
    match Url::parse(url_str) {
        Ok(url) => matches!(url.host(), Some(Host::Domain(_))),
        Err(_) => false,
    }
}

/// Rewrite a hostname URL to its literal-IPv4 equivalent, preserving
/// scheme, port and path. Picks the first non-loopback IPv4 result of a
/// forward DNS lookup. Some embedded discovery clients cannot resolve a
/// hostname in the discovery payload, so the engine sends this form as a
/// second response.
pub async fn resolve_to_ipv4(url_str: &str) -> Result<String, ResolveError> {
    let mut url = Url::parse(url_str)?;
    let host = url.host_str().ok_or(ResolveError::NoHost)?.to_string();

    // lookup_host wants a port; it is irrelevant to the A-record answer.
    let addrs = tokio::net::lookup_host((host.as_str(), 0u16))
        .await
        .map_err(|source| ResolveError::Lookup {
            host: host.clone(),
            source,
        })?;

    let ipv4 = first_routable_ipv4(addrs).ok_or_else(|| ResolveError::NoIpv4(host))?;

    url.set_ip_host(IpAddr::V4(ipv4))
        .map_err(|_| ResolveError::NoHost)?;
    Ok(url.to_string())
}

fn first_routable_ipv4(addrs: impl Iterator<Item = SocketAddr>) -> Option<Ipv4Addr> {
    addrs.filter_map(|addr| match addr.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() => Some(ip),
        _ => None,
    })
    .next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literals_are_not_hostnames() {
        assert!(!is_hostname("http://192.168.1.10:8096"));
        assert!(!is_hostname("http://[fd00::1]:8096"));
        assert!(!is_hostname("https://10.0.0.1"));
    }

    #[test]
    fn domains_are_hostnames() {
        assert!(is_hostname("http://jellyfin.example.com:8096"));
        assert!(is_hostname("https://media.local"));
        assert!(is_hostname("http://nas"));
    }

    #[test]
    fn unparsable_input_is_not_a_hostname() {
        assert!(!is_hostname("not a url"));
        assert!(!is_hostname(""));
        assert!(!is_hostname("://missing-scheme"));
    }

    #[test]
    fn picks_first_non_loopback_v4() {
        let addrs = vec![
            "127.0.0.1:0".parse().unwrap(),
            "[fd00::1]:0".parse().unwrap(),
            "192.168.1.20:0".parse().unwrap(),
            "192.168.1.21:0".parse().unwrap(),
        ];
        let ip = first_routable_ipv4(addrs.into_iter()).unwrap();
        assert_eq!(ip, "192.168.1.20".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn loopback_only_yields_none() {
        let addrs = vec!["127.0.0.1:0".parse().unwrap(), "[::1]:0".parse().unwrap()];
        assert!(first_routable_ipv4(addrs.into_iter()).is_none());
    }

    #[tokio::test]
    async fn localhost_resolves_to_loopback_only_and_fails() {
        let err = resolve_to_ipv4("http://localhost:8096")
            .await
            .expect_err("loopback-only host must not resolve");
        assert!(matches!(err, ResolveError::NoIpv4(_) | ResolveError::Lookup { .. }));
    }

    #[tokio::test]
    async fn garbage_url_fails_resolution() {
        let err = resolve_to_ipv4("not a url").await.expect_err("must fail");
        assert!(matches!(err, ResolveError::InvalidUrl(_)));
    }
}
