mod addr;
mod api;
mod blacklist;
mod cache;
mod config;
mod discovery;
mod stats;
mod upstream;

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::blacklist::IpBlacklist;
use crate::cache::IdentityCache;
use crate::config::Config;
use crate::discovery::{AddressFamily, DiscoveryEngine, FamilyContext};
use crate::stats::RequestStats;
use crate::upstream::UpstreamFetcher;

/// How long shutdown waits for in-flight request handlers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let started_at = Instant::now();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("jellyfin_discovery_proxy=info")),
        )
        .init();

    tracing::info!("Starting jellyfin-discovery-proxy v{}", api::routes::VERSION);

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/jellyfin-discovery-proxy/config.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    tracing::info!("Loaded config from {}", config_path);

    let urls = Arc::new(config.family_urls());
    tracing::info!("Target Jellyfin server IPv4: {}", urls.upstream_v4);
    tracing::info!("Target Jellyfin server IPv6: {}", urls.upstream_v6);

    let blacklist = Arc::new(IpBlacklist::parse(&config.discovery.blacklist));
    if blacklist.count() > 0 {
        tracing::info!("Loaded {} blacklist rule(s)", blacklist.count());
    }

    let ttl = Duration::from_secs(config.cache.ttl_hours * 3600);
    if ttl.is_zero() {
        tracing::info!("Server info will be cached until restart");
    } else {
        tracing::info!("Server info will be cached for {:?}", ttl);
    }

    let cache_v4 = Arc::new(IdentityCache::new(ttl));
    let cache_v6 = Arc::new(IdentityCache::new(ttl));
    let stats = Arc::new(RequestStats::new());
    let fetcher = Arc::new(UpstreamFetcher::new()?);

    warm_caches(&fetcher, &urls, &cache_v4, &cache_v6).await;

    let sockets = bind_sockets(&config.discovery.bind_ip, config.discovery.port).await?;

    let engine = Arc::new(DiscoveryEngine {
        blacklist: blacklist.clone(),
        stats: stats.clone(),
        fetcher,
        limiter: None,
        handlers: TaskTracker::new(),
    });

    let cancel = CancellationToken::new();
    let mut listener_handles = Vec::new();

    for (family, socket) in sockets {
        let (upstream_url, advertise_url, cache) = match family {
            AddressFamily::V4 => (urls.upstream_v4.clone(), urls.advertise_v4.clone(), cache_v4.clone()),
            AddressFamily::V6 => (urls.upstream_v6.clone(), urls.advertise_v6.clone(), cache_v6.clone()),
        };
        let ctx = Arc::new(FamilyContext {
            family,
            socket: Arc::new(socket),
            cache,
            upstream_url,
            advertise_url,
        });
        listener_handles.push(tokio::spawn(discovery::run_listener(
            engine.clone(),
            ctx,
            cancel.clone(),
        )));
    }

    // Dashboard / health API.
    let app_state = api::routes::AppState {
        cache_v4,
        cache_v6,
        stats,
        blacklist,
        urls,
        started_at,
    };
    let app = api::routes::router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind API to {}", config.api.listen))?;
    tracing::info!("Dashboard listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("API server error: {}", e);
        }
    });

    tracing::info!("jellyfin-discovery-proxy is ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutdown signal received");

    cancel.cancel();

    for handle in listener_handles {
        let _ = handle.await;
    }
    let _ = server_handle.await;

    // In-flight handlers finish naturally within a bounded grace period.
    engine.handlers.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, engine.handlers.wait())
        .await
        .is_err()
    {
        tracing::warn!("Some request handlers did not finish within the grace period");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Fetch the upstream identity once per distinct URL so the first
/// discovery request is served from cache. Failure here is retried
/// lazily on the next request, never fatal.
async fn warm_caches(
    fetcher: &UpstreamFetcher,
    urls: &crate::config::FamilyUrls,
    cache_v4: &IdentityCache,
    cache_v6: &IdentityCache,
) {
    match fetcher.fetch(&urls.upstream_v4).await {
        Ok(identity) => {
            if urls.upstream_v6 == urls.upstream_v4 {
                cache_v6.set(identity.clone());
            }
            cache_v4.set(identity);
        }
        Err(e) => {
            tracing::warn!("Could not fetch IPv4 server info at startup: {}", e);
            tracing::warn!("Will try again when discovery requests are received");
        }
    }

    if urls.upstream_v6 != urls.upstream_v4 {
        match fetcher.fetch(&urls.upstream_v6).await {
            Ok(identity) => cache_v6.set(identity),
            Err(e) => {
                tracing::warn!("Could not fetch IPv6 server info at startup: {}", e);
            }
        }
    }
}

/// Bind a wildcard IPv6 UDP socket with IPV6_V6ONLY set. Without the
/// option, a Linux default of `bindv6only=0` makes the `[::]` socket
/// dual-stack: it swallows the IPv4 port, the separate `0.0.0.0` bind
/// fails, and IPv4 clients arrive as v4-mapped peers on the IPv6
/// context with the wrong cache, advertise URL, and blacklist family.
fn bind_udp6_only(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Bind the discovery sockets. IPv6 is attempted first when binding to
/// all interfaces and is optional; a total bind failure is fatal.
async fn bind_sockets(bind_ip: &str, port: u16) -> Result<Vec<(AddressFamily, UdpSocket)>> {
    let mut sockets = Vec::new();

    if bind_ip == "0.0.0.0" {
        match bind_udp6_only(port) {
            Ok(socket) => {
                tracing::info!("Bound UDP6 [::]:{} for discovery requests", port);
                sockets.push((AddressFamily::V6, socket));
            }
            Err(e) => {
                tracing::warn!("UDP6 not available on port {}: {}", port, e);
            }
        }
    }

    let v4_addr = format!("{}:{}", bind_ip, port);
    match UdpSocket::bind(&v4_addr).await {
        Ok(socket) => {
            tracing::info!("Bound UDP4 {} for discovery requests", v4_addr);
            sockets.push((AddressFamily::V4, socket));
        }
        Err(e) => {
            if sockets.is_empty() {
                return Err(e).with_context(|| format!("Failed to bind UDP4 {}", v4_addr));
            }
            tracing::warn!("Could not bind UDP4 {} (possibly covered by UDP6): {}", v4_addr, e);
        }
    }

    if sockets.is_empty() {
        bail!("No UDP listeners could be created on port {}", port);
    }
    Ok(sockets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wildcard_v6_socket_leaves_v4_port_free() {
        let v6 = bind_udp6_only(0).unwrap();
        let port = v6.local_addr().unwrap().port();

        // A dual-stack [::] socket would own the IPv4 port too and make
        // this bind fail with AddrInUse.
        let v4 = UdpSocket::bind(("0.0.0.0", port)).await;
        assert!(
            v4.is_ok(),
            "IPv4 bind on the same port must succeed: {:?}",
            v4.err()
        );
    }

    #[tokio::test]
    async fn both_families_bind_on_the_same_port() {
        // Pick a free port first, then run the real bind path against it.
        let scratch = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = scratch.local_addr().unwrap().port();
        drop(scratch);

        let sockets = bind_sockets("0.0.0.0", port).await.unwrap();
        let families: Vec<_> = sockets.iter().map(|(family, _)| *family).collect();
        assert!(families.contains(&AddressFamily::V4), "IPv4 socket missing: {:?}", families);
    }
}
