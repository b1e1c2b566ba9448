//! Prometheus text exposition format.
//!
//! Renders endpoint counts and breaker state into the Prometheus text
//! exposition format for scraping.

use meshwork_breaker::BreakerSnapshot;
use meshwork_registry::AppSummary;
use meshwork_state::CircuitState;

/// Numeric encoding of circuit state for the gauge.
fn circuit_gauge(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

/// Render the mesh view into Prometheus text format.
pub fn render_prometheus(
    summaries: &[AppSummary],
    breakers: &[BreakerSnapshot],
    mapping_version: u64,
) -> String {
    let mut out = String::new();

    out.push_str("# HELP meshwork_endpoints Registered endpoints by app and status.\n");
    out.push_str("# TYPE meshwork_endpoints gauge\n");
    for summary in summaries {
        for (status, count) in &summary.by_status {
            out.push_str(&format!(
                "meshwork_endpoints{{app_id=\"{}\",status=\"{}\"}} {}\n",
                summary.app_id, status, count
            ));
        }
    }

    out.push_str("# HELP meshwork_circuit_state Circuit state per app (0=closed, 1=half-open, 2=open).\n");
    out.push_str("# TYPE meshwork_circuit_state gauge\n");
    for breaker in breakers {
        out.push_str(&format!(
            "meshwork_circuit_state{{app_id=\"{}\"}} {}\n",
            breaker.app_id,
            circuit_gauge(breaker.state)
        ));
    }

    out.push_str("# HELP meshwork_circuit_consecutive_failures Consecutive failures per app.\n");
    out.push_str("# TYPE meshwork_circuit_consecutive_failures gauge\n");
    for breaker in breakers {
        out.push_str(&format!(
            "meshwork_circuit_consecutive_failures{{app_id=\"{}\"}} {}\n",
            breaker.app_id, breaker.consecutive_failures
        ));
    }

    out.push_str("# HELP meshwork_mapping_version Version of the service mapping table.\n");
    out.push_str("# TYPE meshwork_mapping_version gauge\n");
    out.push_str(&format!("meshwork_mapping_version {mapping_version}\n"));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn summary(app_id: &str, healthy: usize, degraded: usize) -> AppSummary {
        let mut by_status = BTreeMap::new();
        if healthy > 0 {
            by_status.insert("healthy".to_string(), healthy);
        }
        if degraded > 0 {
            by_status.insert("degraded".to_string(), degraded);
        }
        AppSummary {
            app_id: app_id.to_string(),
            total: healthy + degraded,
            by_status,
        }
    }

    #[test]
    fn renders_endpoint_gauges() {
        let out = render_prometheus(&[summary("auth", 2, 1)], &[], 0);
        assert!(out.contains("meshwork_endpoints{app_id=\"auth\",status=\"healthy\"} 2"));
        assert!(out.contains("meshwork_endpoints{app_id=\"auth\",status=\"degraded\"} 1"));
    }

    #[test]
    fn renders_breaker_gauges() {
        let breakers = vec![
            BreakerSnapshot {
                app_id: "auth".to_string(),
                state: CircuitState::Open,
                consecutive_failures: 5,
                opened_at: 1000,
            },
            BreakerSnapshot {
                app_id: "chat".to_string(),
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: 0,
            },
        ];
        let out = render_prometheus(&[], &breakers, 3);
        assert!(out.contains("meshwork_circuit_state{app_id=\"auth\"} 2"));
        assert!(out.contains("meshwork_circuit_state{app_id=\"chat\"} 0"));
        assert!(out.contains("meshwork_circuit_consecutive_failures{app_id=\"auth\"} 5"));
        assert!(out.contains("meshwork_mapping_version 3"));
    }

    #[test]
    fn empty_mesh_renders_headers_only() {
        let out = render_prometheus(&[], &[], 0);
        assert!(out.contains("# TYPE meshwork_endpoints gauge"));
        assert!(!out.contains("app_id="));
    }
}
