//! CPU utilization of the managed instance, read from Cloud Monitoring.

use crate::client::rest::HttpTransport;
use crate::client::RemoteError;
use crate::config::DEFAULT_MONITORING_HOST;
use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use reqwest::Method;
use serde::Deserialize;
use std::time::Duration;

/// Key of the average CPU utilization added by `collect_metrics`.
pub const AVERAGE_CPU_UTILIZATION_KEY: &str = "Spanner_AverageCpuUtilization";
/// Key of the maximum CPU utilization added by `collect_metrics`.
pub const MAX_CPU_UTILIZATION_KEY: &str = "Spanner_MaxCpuUtilization";

pub const CPU_UTILIZATION_METRIC: &str = "spanner.googleapis.com/instance/cpu/utilization";

/// Monitoring filter selecting the CPU utilization of `instance_id`.
pub fn cpu_utilization_filter(instance_id: &str) -> String {
    format!(
        "metric.type=\"{CPU_UTILIZATION_METRIC}\" AND resource.labels.instance_id=\"{instance_id}\""
    )
}

/// Closed time range of the samples to aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

/// How samples within one alignment period of a series are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aligner {
    Mean,
    Max,
}

impl Aligner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mean => "ALIGN_MEAN",
            Self::Max => "ALIGN_MAX",
        }
    }
}

/// How aligned series are combined into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reducer {
    Mean,
    Max,
}

impl Reducer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mean => "REDUCE_MEAN",
            Self::Max => "REDUCE_MAX",
        }
    }

    fn reduce(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        Some(match self {
            Self::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregation {
    pub alignment_period: Duration,
    pub aligner: Aligner,
    pub reducer: Reducer,
}

impl Aggregation {
    pub const DEFAULT_ALIGNMENT_PERIOD: Duration = Duration::from_secs(60);

    pub fn mean() -> Self {
        Self {
            alignment_period: Self::DEFAULT_ALIGNMENT_PERIOD,
            aligner: Aligner::Mean,
            reducer: Reducer::Mean,
        }
    }

    pub fn max() -> Self {
        Self {
            alignment_period: Self::DEFAULT_ALIGNMENT_PERIOD,
            aligner: Aligner::Max,
            reducer: Reducer::Max,
        }
    }
}

/// Source of aggregated metric values.
pub trait MonitoringClient: Send {
    /// Aggregates the time series matching `filter` over `interval` into one
    /// value, or `None` when the interval holds no sample yet.
    fn get_aggregated_metric(
        &self,
        project_id: &str,
        filter: &str,
        interval: &TimeInterval,
        aggregation: &Aggregation,
    ) -> Result<Option<f64>, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct RestMonitoringConfig {
    pub endpoint: String,
    pub access_token: Option<String>,
    pub request_timeout: Duration,
}

impl Default for RestMonitoringConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_MONITORING_HOST.to_string(),
            access_token: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTimeSeriesResponse {
    #[serde(default)]
    time_series: Vec<TimeSeries>,
    /// Empty on the last page.
    #[serde(default)]
    next_page_token: String,
}

#[derive(Deserialize)]
struct TimeSeries {
    #[serde(default)]
    points: Vec<Point>,
}

#[derive(Deserialize)]
struct Point {
    value: TypedValue,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    double_value: Option<f64>,
    /// INT64 values are strings in JSON.
    int64_value: Option<String>,
}

impl TypedValue {
    fn as_f64(&self) -> Option<f64> {
        self.double_value
            .or_else(|| self.int64_value.as_deref().and_then(|v| v.parse().ok()))
    }
}

/// [`MonitoringClient`] over the Cloud Monitoring REST API (v3).
pub struct RestMonitoringClient {
    transport: HttpTransport,
}

impl RestMonitoringClient {
    pub fn new(config: RestMonitoringConfig) -> Result<Self, RemoteError> {
        Ok(Self {
            transport: HttpTransport::new(
                &config.endpoint,
                config.access_token,
                config.request_timeout,
            )?,
        })
    }
}

impl MonitoringClient for RestMonitoringClient {
    fn get_aggregated_metric(
        &self,
        project_id: &str,
        filter: &str,
        interval: &TimeInterval,
        aggregation: &Aggregation,
    ) -> Result<Option<f64>, RemoteError> {
        let mut query = self
            .transport
            .url(&format!("v3/projects/{project_id}/timeSeries"))?;
        query
            .query_pairs_mut()
            .append_pair("filter", filter)
            .append_pair(
                "interval.startTime",
                &interval.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .append_pair(
                "interval.endTime",
                &interval.end.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .append_pair(
                "aggregation.alignmentPeriod",
                &format!("{}s", aggregation.alignment_period.as_secs()),
            )
            .append_pair("aggregation.perSeriesAligner", aggregation.aligner.as_str())
            .append_pair("aggregation.crossSeriesReducer", aggregation.reducer.as_str())
            .append_pair("view", "FULL");

        let mut values = Vec::new();
        let mut page_token = String::new();
        loop {
            let mut url = query.clone();
            if !page_token.is_empty() {
                url.query_pairs_mut().append_pair("pageToken", &page_token);
            }
            let response: ListTimeSeriesResponse = self.transport.send(Method::GET, url, None)?;
            values.extend(
                response
                    .time_series
                    .iter()
                    .flat_map(|series| series.points.iter())
                    .filter_map(|point| point.value.as_f64()),
            );
            if response.next_page_token.is_empty() {
                break;
            }
            page_token = response.next_page_token;
        }
        debug!(
            "{} sample(s) for {filter} with {}",
            values.len(),
            aggregation.reducer.as_str()
        );
        Ok(aggregation.reducer.reduce(&values))
    }
}
