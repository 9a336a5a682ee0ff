use std::net::IpAddr;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Default)]
struct StatsInner {
    last_request_time: Option<DateTime<Utc>>,
    last_request_ip: Option<IpAddr>,
    total_requests: u64,
}

/// Consistent view of the request counters, taken under one lock.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_request_ip: Option<IpAddr>,
    pub total_requests: u64,
}

/// Bookkeeping for accepted discovery requests. Purely observational;
/// read by the dashboard, written once per non-blacklisted request.
#[derive(Default)]
pub struct RequestStats {
    inner: RwLock<StatsInner>,
}

impl RequestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, ip: IpAddr) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.last_request_time = Some(Utc::now());
        inner.last_request_ip = Some(ip);
        inner.total_requests += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        StatsSnapshot {
            last_request_time: inner.last_request_time,
            last_request_ip: inner.last_request_ip,
            total_requests: inner.total_requests,
        }
    }
}
