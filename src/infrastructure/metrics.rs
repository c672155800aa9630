//! Metrics backend client
//!
//! Per-pod CPU load and memory usage from Prometheus instant queries.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::MetricsConfig;
use crate::error::MetricsError;

/// Metric collected for each pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodMetric {
    MemoryUsage,
    CpuLoad,
}

impl PodMetric {
    /// Instant query selecting this metric for one pod
    pub fn query(&self, pod_name: &str) -> String {
        match self {
            Self::MemoryUsage => format!(
                "sum(container_memory_working_set_bytes{{pod=\"{}\",container=\"\"}})",
                pod_name
            ),
            Self::CpuLoad => format!(
                "sum(container_cpu_load_average_10s{{pod=\"{}\"}})",
                pod_name
            ),
        }
    }
}

/// Source of per-pod metrics
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn query_pod_metric(&self, pod_name: &str, metric: PodMetric)
        -> Result<f64, MetricsError>;
}

#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    #[serde(default)]
    data: Option<PrometheusData>,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    #[serde(default)]
    result: Vec<PrometheusSample>,
}

#[derive(Debug, Deserialize)]
struct PrometheusSample {
    /// `[unix_time, "value"]`
    value: (serde_json::Value, String),
}

/// Extract the first sample's value from an instant query response body
fn parse_response(body: &str) -> Result<f64, MetricsError> {
    let response: PrometheusResponse =
        serde_json::from_str(body).map_err(|e| MetricsError::Parse(e.to_string()))?;

    if response.status != "success" {
        return Err(MetricsError::Unsuccessful {
            status: response.status,
        });
    }

    let sample = response
        .data
        .and_then(|d| d.result.into_iter().next())
        .ok_or(MetricsError::Empty)?;

    sample
        .value
        .1
        .parse::<f64>()
        .map_err(|e| MetricsError::Parse(format!("'{}': {}", sample.value.1, e)))
}

/// [`MetricsBackend`] querying the Prometheus HTTP API
pub struct PrometheusClient {
    client: Client,
    query_url: String,
}

impl PrometheusClient {
    pub fn new(config: &MetricsConfig) -> Result<Self, MetricsError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MetricsError::Request(e.to_string()))?;

        Ok(Self {
            client,
            query_url: config.prometheus_url.clone(),
        })
    }
}

#[async_trait]
impl MetricsBackend for PrometheusClient {
    async fn query_pod_metric(
        &self,
        pod_name: &str,
        metric: PodMetric,
    ) -> Result<f64, MetricsError> {
        let query = metric.query(pod_name);
        debug!("Querying Prometheus at {}: {}", self.query_url, query);

        let response = self
            .client
            .get(&self.query_url)
            .query(&[("query", query.as_str())])
            .send()
            .await
            .map_err(|e| MetricsError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MetricsError::HttpStatus {
                status: response.status().as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| MetricsError::Request(e.to_string()))?;
        parse_response(&body)
    }
}
