//! Connection and traffic metrics, labelled by account.
//!
//! Counters and gauges are plain atomics; the exposition endpoint renders
//! them in Prometheus text format on demand. Exposed families:
//!
//! - `streamsockets_active_connections` (gauge)
//! - `streamsockets_connection_status` (gauge, 0/1)
//! - `streamsockets_total_connections` (counter)
//! - `streamsockets_bytes_received_total` (counter)
//! - `streamsockets_bytes_sent_total` (counter)
//! - `streamsockets_connection_duration_seconds` (histogram)

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

/// Upper bounds of the connection-duration histogram, in seconds.
const DURATION_BUCKETS: [u64; 9] = [1, 5, 10, 30, 60, 300, 600, 1800, 3600];

/// Per-account metric values.
#[derive(Default)]
struct AccountMetrics {
    active_connections: AtomicI64,
    connection_status: AtomicI64,
    total_connections: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    /// Non-cumulative bucket counts; made cumulative at render time.
    duration_buckets: [AtomicU64; DURATION_BUCKETS.len() + 1],
    duration_sum_seconds: AtomicU64,
    duration_count: AtomicU64,
}

/// Process-wide metrics registry. Cheap to clone via `Arc`.
#[derive(Default)]
pub struct Metrics {
    accounts: Mutex<HashMap<String, Arc<AccountMetrics>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn account(&self, name: &str) -> Arc<AccountMetrics> {
        let mut accounts = self
            .accounts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            accounts
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AccountMetrics::default())),
        )
    }

    pub fn record_connection_start(&self, account_name: &str) {
        let m = self.account(account_name);
        m.active_connections.fetch_add(1, Ordering::Relaxed);
        m.connection_status.store(1, Ordering::Relaxed);
        m.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_end(&self, account_name: &str, duration: Duration) {
        let m = self.account(account_name);
        m.active_connections.fetch_sub(1, Ordering::Relaxed);
        m.connection_status.store(0, Ordering::Relaxed);

        let seconds = duration.as_secs();
        let bucket = DURATION_BUCKETS
            .iter()
            .position(|&le| seconds <= le)
            .unwrap_or(DURATION_BUCKETS.len());
        m.duration_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        m.duration_sum_seconds.fetch_add(seconds, Ordering::Relaxed);
        m.duration_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, account_name: &str, bytes: u64) {
        self.account(account_name)
            .bytes_received
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_sent(&self, account_name: &str, bytes: u64) {
        self.account(account_name)
            .bytes_sent
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Render every family in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let accounts: Vec<(String, Arc<AccountMetrics>)> = {
            let map = self
                .accounts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut entries: Vec<_> = map
                .iter()
                .map(|(name, m)| (name.clone(), Arc::clone(m)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        let mut out = String::new();

        render_family(
            &mut out,
            "streamsockets_active_connections",
            "gauge",
            "Number of active WebSocket connections by account",
            &accounts,
            |m| m.active_connections.load(Ordering::Relaxed).to_string(),
        );
        render_family(
            &mut out,
            "streamsockets_connection_status",
            "gauge",
            "Connection status by account (1 = connected, 0 = disconnected)",
            &accounts,
            |m| m.connection_status.load(Ordering::Relaxed).to_string(),
        );
        render_family(
            &mut out,
            "streamsockets_total_connections",
            "counter",
            "Total number of connections by account",
            &accounts,
            |m| m.total_connections.load(Ordering::Relaxed).to_string(),
        );
        render_family(
            &mut out,
            "streamsockets_bytes_received_total",
            "counter",
            "Total bytes received from clients by account",
            &accounts,
            |m| m.bytes_received.load(Ordering::Relaxed).to_string(),
        );
        render_family(
            &mut out,
            "streamsockets_bytes_sent_total",
            "counter",
            "Total bytes sent to clients by account",
            &accounts,
            |m| m.bytes_sent.load(Ordering::Relaxed).to_string(),
        );

        let name = "streamsockets_connection_duration_seconds";
        let _ = writeln!(out, "# HELP {name} Connection duration in seconds by account");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (account, m) in &accounts {
            let mut cumulative = 0u64;
            for (i, le) in DURATION_BUCKETS.iter().enumerate() {
                cumulative += m.duration_buckets[i].load(Ordering::Relaxed);
                let _ = writeln!(
                    out,
                    "{name}_bucket{{account_name=\"{account}\",le=\"{le}\"}} {cumulative}"
                );
            }
            cumulative += m.duration_buckets[DURATION_BUCKETS.len()].load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "{name}_bucket{{account_name=\"{account}\",le=\"+Inf\"}} {cumulative}"
            );
            let _ = writeln!(
                out,
                "{name}_sum{{account_name=\"{account}\"}} {}",
                m.duration_sum_seconds.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "{name}_count{{account_name=\"{account}\"}} {}",
                m.duration_count.load(Ordering::Relaxed)
            );
        }

        out
    }
}

fn render_family(
    out: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    accounts: &[(String, Arc<AccountMetrics>)],
    value: impl Fn(&AccountMetrics) -> String,
) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    for (account, m) in accounts {
        let _ = writeln!(out, "{name}{{account_name=\"{account}\"}} {}", value(m));
    }
}

/// Router serving the exposition endpoint at `path`.
pub fn router(metrics: Arc<Metrics>, path: &str) -> Router {
    Router::new()
        .route(path, get(render_handler))
        .with_state(metrics)
}

async fn render_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lifecycle_updates_gauges() {
        let metrics = Metrics::new();
        metrics.record_connection_start("user1");
        metrics.record_connection_start("user1");
        metrics.record_connection_end("user1", Duration::from_secs(7));

        let text = metrics.render();
        assert!(text.contains("streamsockets_active_connections{account_name=\"user1\"} 1"));
        assert!(text.contains("streamsockets_connection_status{account_name=\"user1\"} 0"));
        assert!(text.contains("streamsockets_total_connections{account_name=\"user1\"} 2"));
    }

    #[test]
    fn byte_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_bytes_received("user1", 100);
        metrics.record_bytes_received("user1", 50);
        metrics.record_bytes_sent("user1", 9);

        let text = metrics.render();
        assert!(text.contains("streamsockets_bytes_received_total{account_name=\"user1\"} 150"));
        assert!(text.contains("streamsockets_bytes_sent_total{account_name=\"user1\"} 9"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let metrics = Metrics::new();
        metrics.record_connection_start("user1");
        metrics.record_connection_end("user1", Duration::from_secs(3));
        metrics.record_connection_start("user1");
        metrics.record_connection_end("user1", Duration::from_secs(45));

        let text = metrics.render();
        // 3s lands in le="5"; both observations are <= 60.
        assert!(text.contains(
            "streamsockets_connection_duration_seconds_bucket{account_name=\"user1\",le=\"1\"} 0"
        ));
        assert!(text.contains(
            "streamsockets_connection_duration_seconds_bucket{account_name=\"user1\",le=\"5\"} 1"
        ));
        assert!(text.contains(
            "streamsockets_connection_duration_seconds_bucket{account_name=\"user1\",le=\"60\"} 2"
        ));
        assert!(text.contains(
            "streamsockets_connection_duration_seconds_bucket{account_name=\"user1\",le=\"+Inf\"} 2"
        ));
        assert!(text.contains(
            "streamsockets_connection_duration_seconds_sum{account_name=\"user1\"} 48"
        ));
        assert!(text.contains(
            "streamsockets_connection_duration_seconds_count{account_name=\"user1\"} 2"
        ));
    }

    #[test]
    fn accounts_render_in_stable_order() {
        let metrics = Metrics::new();
        metrics.record_connection_start("zeta");
        metrics.record_connection_start("alpha");
        let text = metrics.render();
        let alpha = text.find("account_name=\"alpha\"").unwrap();
        let zeta = text.find("account_name=\"zeta\"").unwrap();
        assert!(alpha < zeta);
    }
}
