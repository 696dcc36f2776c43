//! Outbound connectivity check for the dashboard
//!
//! A TCP connect to well-known resolvers, cached so dashboard polling does
//! not turn into a connect storm.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Cloudflare and Quad9 DNS over TCP
pub const DEFAULT_TARGETS: [&str; 2] = ["1.1.1.1:53", "9.9.9.9:53"];

const CONNECT_TIMEOUT: Duration = Duration::from_millis(800);

pub struct UplinkCheck {
    targets: Vec<SocketAddr>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, bool)>>,
}

impl UplinkCheck {
    pub fn new(ttl: Duration) -> Self {
        let targets = DEFAULT_TARGETS
            .iter()
            .filter_map(|t| t.parse().ok())
            .collect();
        Self::with_targets(targets, ttl)
    }

    pub fn with_targets(targets: Vec<SocketAddr>, ttl: Duration) -> Self {
        Self {
            targets,
            ttl,
            cached: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<bool> {
        let cached = self.cached.lock().ok()?;
        match *cached {
            Some((at, up)) if at.elapsed() < self.ttl => Some(up),
            _ => None,
        }
    }

    /// Whether any target accepted a connection, at most one attempt per TTL
    pub async fn is_up(&self) -> bool {
        if let Some(up) = self.cached() {
            return up;
        }

        let mut up = false;
        for target in &self.targets {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await {
                Ok(Ok(_)) => {
                    up = true;
                    break;
                }
                Ok(Err(e)) => debug!("Uplink check to {} failed: {}", target, e),
                Err(_) => debug!("Uplink check to {} timed out", target),
            }
        }

        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some((Instant::now(), up));
        }
        up
    }
}
