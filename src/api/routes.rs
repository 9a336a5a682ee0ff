use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    response::Html,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::blacklist::IpBlacklist;
use crate::cache::IdentityCache;
use crate::config::FamilyUrls;
use crate::stats::{RequestStats, StatsSnapshot};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Read-only view into the proxy's state. The dashboard has no write
/// path into the discovery core.
#[derive(Clone)]
pub struct AppState {
    pub cache_v4: Arc<IdentityCache>,
    pub cache_v6: Arc<IdentityCache>,
    pub stats: Arc<RequestStats>,
    pub blacklist: Arc<IpBlacklist>,
    pub urls: Arc<FamilyUrls>,
    pub started_at: Instant,
}

#[derive(Serialize)]
pub struct CacheView {
    pub server_id: Option<String>,
    pub server_name: Option<String>,
    pub age_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub upstream_url_v4: String,
    pub upstream_url_v6: String,
    pub advertise_url_v4: String,
    pub advertise_url_v6: String,
    pub cache_v4: CacheView,
    pub cache_v6: CacheView,
    pub blacklist_rules: usize,
    pub stats: StatsSnapshot,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

fn cache_view(cache: &IdentityCache) -> CacheView {
    let identity = cache.get();
    CacheView {
        server_id: identity.as_ref().map(|i| i.id.clone()),
        server_name: identity.as_ref().map(|i| i.server_name.clone()),
        age_secs: cache.age().map(|age| age.as_secs()),
    }
}

fn build_status(state: &AppState) -> StatusResponse {
    StatusResponse {
        version: VERSION,
        uptime_secs: state.started_at.elapsed().as_secs(),
        upstream_url_v4: state.urls.upstream_v4.clone(),
        upstream_url_v6: state.urls.upstream_v6.clone(),
        advertise_url_v4: state.urls.advertise_v4.clone(),
        advertise_url_v6: state.urls.advertise_v6.clone(),
        cache_v4: cache_view(&state.cache_v4),
        cache_v6: cache_view(&state.cache_v6),
        blacklist_rules: state.blacklist.count(),
        stats: state.stats.snapshot(),
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(build_status(&state))
}

async fn dashboard(State(state): State<AppState>) -> Html<String> {
    let status = build_status(&state);

    let fmt_cache = |view: &CacheView| match (&view.server_name, &view.server_id, view.age_secs) {
        (Some(name), Some(id), Some(age)) => format!("{} ({}), cached {}s ago", name, id, age),
        _ => "no cached identity".to_string(),
    };
    let last_request = match (&status.stats.last_request_ip, &status.stats.last_request_time) {
        (Some(ip), Some(time)) => format!("{} at {}", ip, time.format("%Y-%m-%d %H:%M:%S")),
        _ => "never".to_string(),
    };

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Jellyfin Discovery Proxy</title></head>
<body>
<h1>Jellyfin Discovery Proxy v{version}</h1>
<p>Uptime: {uptime}s</p>
<h2>Upstream</h2>
<ul>
<li>IPv4: {up4} (advertising {ad4})</li>
<li>IPv6: {up6} (advertising {ad6})</li>
</ul>
<h2>Cache</h2>
<ul>
<li>IPv4: {cache4}</li>
<li>IPv6: {cache6}</li>
</ul>
<h2>Requests</h2>
<p>Total: {total}, last from {last}</p>
<p>Blacklist rules: {rules}</p>
</body>
</html>"#,
        version = status.version,
        uptime = status.uptime_secs,
        up4 = status.upstream_url_v4,
        ad4 = status.advertise_url_v4,
        up6 = status.upstream_url_v6,
        ad6 = status.advertise_url_v6,
        cache4 = fmt_cache(&status.cache_v4),
        cache6 = fmt_cache(&status.cache_v6),
        total = status.stats.total_requests,
        last = last_request,
        rules = status.blacklist_rules,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::ServerIdentity;
    use std::time::Duration;

    fn test_state() -> AppState {
        let cache_v4 = Arc::new(IdentityCache::new(Duration::from_secs(3600)));
        cache_v4.set(ServerIdentity {
            id: "abc123".to_string(),
            server_name: "Home Media".to_string(),
        });
        AppState {
            cache_v4,
            cache_v6: Arc::new(IdentityCache::new(Duration::from_secs(3600))),
            stats: Arc::new(RequestStats::new()),
            blacklist: Arc::new(IpBlacklist::parse("10.0.0.0/8")),
            urls: Arc::new(FamilyUrls {
                upstream_v4: "http://10.0.0.5:8096".to_string(),
                upstream_v6: "http://[fd00::5]:8096".to_string(),
                advertise_v4: "http://jellyfin.example.com:8096".to_string(),
                advertise_v6: "http://[fd00::5]:8096".to_string(),
            }),
            started_at: Instant::now(),
        }
    }

    #[test]
    fn status_reflects_cache_and_blacklist() {
        let state = test_state();
        state.stats.record_request("203.0.113.5".parse().unwrap());

        let status = build_status(&state);
        assert_eq!(status.blacklist_rules, 1);
        assert_eq!(status.cache_v4.server_id.as_deref(), Some("abc123"));
        assert_eq!(status.cache_v4.server_name.as_deref(), Some("Home Media"));
        assert!(status.cache_v6.server_id.is_none());
        assert_eq!(status.stats.total_requests, 1);
    }

    #[test]
    fn status_serializes_to_json() {
        let status = build_status(&test_state());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["cache_v4"]["server_id"], "abc123");
        assert!(json["cache_v6"]["server_id"].is_null());
        assert_eq!(json["blacklist_rules"], 1);
    }
}
