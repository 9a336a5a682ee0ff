use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::addr;
use crate::blacklist::IpBlacklist;
use crate::cache::IdentityCache;
use crate::stats::RequestStats;
use crate::upstream::{ServerIdentity, UpstreamFetcher};

/// The one discovery query this proxy answers, compared
/// case-insensitively. Anything else on the wire is dropped.
pub const DISCOVERY_QUERY: &str = "Who is JellyfinServer?";

const MAX_PACKET_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Everything that is per-address-family: the bound socket, the identity
/// cache, and the URLs used for fetching and advertising. Failure of one
/// family never touches the other's context.
pub struct FamilyContext {
    pub family: AddressFamily,
    pub socket: Arc<UdpSocket>,
    pub cache: Arc<IdentityCache>,
    pub upstream_url: String,
    pub advertise_url: String,
}

/// Shared, family-independent state of the discovery engine.
pub struct DiscoveryEngine {
    pub blacklist: Arc<IpBlacklist>,
    pub stats: Arc<RequestStats>,
    pub fetcher: Arc<UpstreamFetcher>,
    /// Optional cap on concurrent request handlers. None means unbounded
    /// fan-out, which is the default for the trusted-LAN deployment.
    pub limiter: Option<Arc<Semaphore>>,
    /// Tracks in-flight handlers so shutdown can wait for them.
    pub handlers: TaskTracker,
}

/// Jellyfin discovery response wire format. Constructed fresh per
/// outgoing datagram.
#[derive(Serialize)]
struct DiscoveryResponse<'a> {
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Id")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "EndpointAddress")]
    endpoint_address: Option<String>,
}

/// Receive loop for one bound socket. Valid queries are dispatched to
/// independent handler tasks; handlers never serialize against each other.
pub async fn run_listener(
    engine: Arc<DiscoveryEngine>,
    ctx: Arc<FamilyContext>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    tracing::debug!("{} listener started on {:?}", ctx.family, ctx.socket.local_addr());

    loop {
        let (len, peer) = tokio::select! {
            received = ctx.socket.recv_from(&mut buf) => {
                match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!("{} receive error: {}", ctx.family, e);
                        continue;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("{} listener shutting down", ctx.family);
                break;
            }
        };

        let message = String::from_utf8_lossy(&buf[..len]);
        if message.eq_ignore_ascii_case(DISCOVERY_QUERY) {
            tracing::info!("Discovery request from {} ({})", peer, ctx.family);
            let engine_for_task = engine.clone();
            let ctx_for_task = ctx.clone();
            engine.handlers.spawn(async move {
                handle_query(engine_for_task, ctx_for_task, peer).await;
            });
        } else {
            tracing::warn!("Ignoring unrecognized message from {}: {:?}", peer, message);
        }
    }
}

/// Per-request handler: access check, stats, identity resolution, and the
/// one-or-two datagram fan-out. Every failure path ends in silence; the
/// wire protocol has no error frame.
pub async fn handle_query(engine: Arc<DiscoveryEngine>, ctx: Arc<FamilyContext>, peer: SocketAddr) {
    let _permit = match &engine.limiter {
        Some(limiter) => match limiter.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => return,
        },
        None => None,
    };

    // A dual-stack socket reports IPv4 peers as v4-mapped IPv6 addresses
    // (::ffff:a.b.c.d); canonicalize so IPv4 blacklist rules still match.
    let peer_ip = peer.ip().to_canonical();

    // Blocked clients get silence, indistinguishable from an absent server.
    if engine.blacklist.is_blocked(peer_ip) {
        tracing::warn!("Ignoring request from blacklisted IP {}", peer_ip);
        return;
    }

    engine.stats.record_request(peer_ip);

    let identity = match ctx.cache.get() {
        Some(identity) => {
            tracing::debug!("Using cached {} server info", ctx.family);
            identity
        }
        None => {
            tracing::info!("{} cache empty or expired, fetching fresh server info", ctx.family);
            match engine.fetcher.fetch(&ctx.upstream_url).await {
                Ok(identity) => {
                    ctx.cache.set(identity.clone());
                    identity
                }
                Err(e) => {
                    tracing::warn!(
                        "Not responding to {}: upstream fetch failed: {}",
                        peer,
                        e
                    );
                    return;
                }
            }
        }
    };

    // Hostname advertise addresses get a second, literal-IP response for
    // clients that cannot resolve names from the discovery payload.
    let resolved = if addr::is_hostname(&ctx.advertise_url) {
        match addr::resolve_to_ipv4(&ctx.advertise_url).await {
            Ok(ip_url) => {
                tracing::info!("Resolved {} to {}, sending second response", ctx.advertise_url, ip_url);
                Some(ip_url)
            }
            Err(e) => {
                tracing::warn!("Could not resolve {} to an IP: {}", ctx.advertise_url, e);
                None
            }
        }
    } else {
        None
    };

    send_fanout(&ctx.socket, peer, &ctx.advertise_url, resolved.as_deref(), &identity).await;
}

/// Emit the response datagrams for one request: always the advertise
/// form, plus the literal-IP form when the hostname resolved.
async fn send_fanout(
    socket: &UdpSocket,
    peer: SocketAddr,
    advertise_url: &str,
    resolved_ip_url: Option<&str>,
    identity: &ServerIdentity,
) {
    send_response(socket, peer, advertise_url, identity).await;
    if let Some(ip_url) = resolved_ip_url {
        send_response(socket, peer, ip_url, identity).await;
    }
}

/// Fire-and-forget send of one discovery response datagram.
async fn send_response(socket: &UdpSocket, peer: SocketAddr, address: &str, identity: &ServerIdentity) {
    let response = DiscoveryResponse {
        address,
        id: &identity.id,
        name: &identity.server_name,
        endpoint_address: None,
    };

    let payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!("Failed to serialize discovery response: {}", e);
            return;
        }
    };

    match socket.send_to(&payload, peer).await {
        Ok(sent) => {
            tracing::info!(
                "Sent discovery response to {} (server: {}, address: {}, {} bytes)",
                peer,
                identity.server_name,
                address,
                sent
            );
        }
        Err(e) => {
            tracing::error!("Failed to send response to {}: {}", peer, e);
        }
    }
}
