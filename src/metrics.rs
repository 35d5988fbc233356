//! Prometheus text-exposition metrics for the proxy (§6: "Metrics").
//!
//! A single collector is shared (behind a mutex, per the teacher's own
//! `parking_lot` convention) between the HTTP pipeline and the SSH bastion.
//! It never suspends and holds no locks across `.await` points — callers
//! take the lock, record one counter bump, and release it.

use std::time::Instant;

/// Counters and gauges the proxy exposes at `metrics_path`.
pub struct MetricsCollector {
    start: Instant,
    http_requests_total: u64,
    http_status_2xx: u64,
    http_status_3xx: u64,
    http_status_4xx: u64,
    http_status_5xx: u64,
    oauth_redirects_total: u64,
    oauth_failures_total: u64,
    ssh_connections_total: u64,
    ssh_auth_failures_total: u64,
    ssh_active_connections: i64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            http_requests_total: 0,
            http_status_2xx: 0,
            http_status_3xx: 0,
            http_status_4xx: 0,
            http_status_5xx: 0,
            oauth_redirects_total: 0,
            oauth_failures_total: 0,
            ssh_connections_total: 0,
            ssh_auth_failures_total: 0,
            ssh_active_connections: 0,
        }
    }

    pub fn on_http_response(&mut self, status: u16) {
        self.http_requests_total += 1;
        match status {
            200..=299 => self.http_status_2xx += 1,
            300..=399 => self.http_status_3xx += 1,
            400..=499 => self.http_status_4xx += 1,
            500..=599 => self.http_status_5xx += 1,
            _ => {}
        }
    }

    pub fn on_oauth_redirect(&mut self) {
        self.oauth_redirects_total += 1;
    }

    pub fn on_oauth_failure(&mut self) {
        self.oauth_failures_total += 1;
    }

    pub fn on_ssh_connection_accepted(&mut self) {
        self.ssh_connections_total += 1;
        self.ssh_active_connections += 1;
    }

    pub fn on_ssh_connection_closed(&mut self) {
        self.ssh_active_connections -= 1;
    }

    pub fn on_ssh_auth_failure(&mut self) {
        self.ssh_auth_failures_total += 1;
    }

    /// Render the current snapshot in Prometheus text exposition format.
    /// `registry_len` is sampled fresh from the caller at export time since
    /// the collector doesn't hold a reference to the registry itself.
    pub fn to_prometheus(&self, registry_len: usize) -> String {
        let mut out = String::new();

        out.push_str("# HELP workspace_gate_uptime_seconds Proxy uptime in seconds.\n");
        out.push_str("# TYPE workspace_gate_uptime_seconds gauge\n");
        out.push_str(&format!(
            "workspace_gate_uptime_seconds {}\n",
            self.start.elapsed().as_secs()
        ));

        out.push_str("# HELP workspace_gate_http_requests_total Total HTTP requests by status class.\n");
        out.push_str("# TYPE workspace_gate_http_requests_total counter\n");
        out.push_str(&format!(
            "workspace_gate_http_requests_total{{class=\"2xx\"}} {}\n",
            self.http_status_2xx
        ));
        out.push_str(&format!(
            "workspace_gate_http_requests_total{{class=\"3xx\"}} {}\n",
            self.http_status_3xx
        ));
        out.push_str(&format!(
            "workspace_gate_http_requests_total{{class=\"4xx\"}} {}\n",
            self.http_status_4xx
        ));
        out.push_str(&format!(
            "workspace_gate_http_requests_total{{class=\"5xx\"}} {}\n",
            self.http_status_5xx
        ));

        out.push_str("# HELP workspace_gate_oauth_redirects_total Total OAuth redirects issued.\n");
        out.push_str("# TYPE workspace_gate_oauth_redirects_total counter\n");
        out.push_str(&format!(
            "workspace_gate_oauth_redirects_total {}\n",
            self.oauth_redirects_total
        ));

        out.push_str("# HELP workspace_gate_oauth_failures_total Total OAuth authorization failures.\n");
        out.push_str("# TYPE workspace_gate_oauth_failures_total counter\n");
        out.push_str(&format!(
            "workspace_gate_oauth_failures_total {}\n",
            self.oauth_failures_total
        ));

        out.push_str("# HELP workspace_gate_registry_size Current number of routable hostnames.\n");
        out.push_str("# TYPE workspace_gate_registry_size gauge\n");
        out.push_str(&format!("workspace_gate_registry_size {}\n", registry_len));

        out.push_str("# HELP workspace_gate_ssh_connections_total Total SSH connections accepted.\n");
        out.push_str("# TYPE workspace_gate_ssh_connections_total counter\n");
        out.push_str(&format!(
            "workspace_gate_ssh_connections_total {}\n",
            self.ssh_connections_total
        ));

        out.push_str("# HELP workspace_gate_ssh_auth_failures_total Total SSH authorization failures.\n");
        out.push_str("# TYPE workspace_gate_ssh_auth_failures_total counter\n");
        out.push_str(&format!(
            "workspace_gate_ssh_auth_failures_total {}\n",
            self.ssh_auth_failures_total
        ));

        out.push_str("# HELP workspace_gate_ssh_active_connections Current active SSH connections.\n");
        out.push_str("# TYPE workspace_gate_ssh_active_connections gauge\n");
        out.push_str(&format!(
            "workspace_gate_ssh_active_connections {}\n",
            self.ssh_active_connections
        ));

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_collector_exports_zeroed_counters() {
        let mc = MetricsCollector::new();
        let text = mc.to_prometheus(0);
        assert!(text.contains("workspace_gate_http_requests_total{class=\"2xx\"} 0"));
        assert!(text.contains("workspace_gate_registry_size 0"));
    }

    #[test]
    fn http_responses_bucket_by_status_class() {
        let mut mc = MetricsCollector::new();
        mc.on_http_response(200);
        mc.on_http_response(307);
        mc.on_http_response(404);
        mc.on_http_response(502);
        let text = mc.to_prometheus(3);
        assert!(text.contains("class=\"2xx\"} 1"));
        assert!(text.contains("class=\"3xx\"} 1"));
        assert!(text.contains("class=\"4xx\"} 1"));
        assert!(text.contains("class=\"5xx\"} 1"));
        assert!(text.contains("workspace_gate_registry_size 3"));
    }

    #[test]
    fn ssh_connection_lifecycle_tracks_active_count() {
        let mut mc = MetricsCollector::new();
        mc.on_ssh_connection_accepted();
        mc.on_ssh_connection_accepted();
        mc.on_ssh_connection_closed();
        let text = mc.to_prometheus(0);
        assert!(text.contains("workspace_gate_ssh_connections_total 2"));
        assert!(text.contains("workspace_gate_ssh_active_connections 1"));
    }

    #[test]
    fn oauth_counters_increment_independently() {
        let mut mc = MetricsCollector::new();
        mc.on_oauth_redirect();
        mc.on_oauth_redirect();
        mc.on_oauth_failure();
        let text = mc.to_prometheus(0);
        assert!(text.contains("workspace_gate_oauth_redirects_total 2"));
        assert!(text.contains("workspace_gate_oauth_failures_total 1"));
    }
}
