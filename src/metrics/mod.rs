//! Service metrics from the Prometheus time-series backend.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

/// Latency reported when the backend has no series for a service; encodes
/// the worst case so scaling errs on the side of capacity.
pub const MISSING_LATENCY_DEFAULT: f64 = 30.0;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Request-rate, latency and CPU readings for one service.
#[async_trait]
pub trait MetricsOps: Send + Sync {
    /// Request completion rate in requests/sec; 0.0 when the series is missing
    async fn get_request_rate(&self, name: &str) -> f64;

    /// Average request latency in seconds over the window; 30.0 when missing
    async fn get_latency(&self, name: &str) -> f64;

    /// CPU utilization as a percentage of the container limit; 0.0 when missing
    async fn get_cpu_utilization(&self, name: &str) -> f64;
}

/// [`MetricsOps`] against a Prometheus HTTP endpoint.
pub struct PrometheusClient {
    http: reqwest::Client,
    host: String,
    /// Rate window in seconds, aligned with the scaling decision interval
    window_secs: u64,
}

impl PrometheusClient {
    pub fn new(host: &str, window_secs: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(anyhow::Error::from)?;

        Ok(Self {
            http,
            host: host.trim_end_matches('/').to_string(),
            window_secs,
        })
    }

    /// Run an instant query; any transport, decoding, or empty-result
    /// condition maps to NaN, which the metric accessors replace with
    /// their documented defaults.
    async fn query(&self, query: &str) -> f64 {
        let endpoint = format!("{}/api/v1/query", self.host);
        let response = match self
            .http
            .get(&endpoint)
            .query(&[("query", query)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Prometheus query failed: {}", e);
                return f64::NAN;
            }
        };

        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Prometheus response was not JSON: {}", e);
                return f64::NAN;
            }
        };

        instant_value(&body)
    }
}

#[async_trait]
impl MetricsOps for PrometheusClient {
    async fn get_request_rate(&self, name: &str) -> f64 {
        let query = format!(
            "sum(rate(flask_http_request_total{{service=\"{}\"}}[{}s]))by(service)",
            name, self.window_secs
        );
        let rate = self.query(&query).await;
        debug!("Request rate for {}: {}", name, rate);
        if rate.is_nan() { 0.0 } else { rate }
    }

    async fn get_latency(&self, name: &str) -> f64 {
        let query = format!(
            "(sum(rate(flask_http_request_duration_seconds_sum{{service=\"{0}\"}}[{1}s])) by (service))\
             /(sum(rate(flask_http_request_duration_seconds_count{{service=\"{0}\"}}[{1}s])) by (service))",
            name, self.window_secs
        );
        let latency = self.query(&query).await;
        if latency.is_nan() {
            MISSING_LATENCY_DEFAULT
        } else {
            latency
        }
    }

    async fn get_cpu_utilization(&self, name: &str) -> f64 {
        let query = format!(
            "round(100 *sum(rate(container_cpu_usage_seconds_total{{container=~\"{0}.*\"}}[40s])) \
             by (pod_name, container_name)\
             /sum(kube_pod_container_resource_limits{{container=~\"{0}.*\",resource=\"cpu\"}})\
             by (pod_name, container_name))",
            name
        );
        let utilization = self.query(&query).await;
        if utilization.is_nan() { 0.0 } else { utilization }
    }
}

/// Extract the scalar of the first result of an instant-query response.
fn instant_value(body: &serde_json::Value) -> f64 {
    body["data"]["result"]
        .as_array()
        .and_then(|results| results.first())
        .and_then(|result| result["value"].as_array())
        .and_then(|value| value.get(1))
        .and_then(|scalar| scalar.as_str())
        .and_then(|scalar| scalar.parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}
