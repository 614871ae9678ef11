//! Best-effort time-series sink
//!
//! Each completed run writes one point for dashboards. The reading log is the
//! durability guarantee, so a sink failure never changes a run's outcome.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use umr_common::config::{resolve_secret, InfluxSection};
use umr_common::MeterType;

use crate::types::Reading;

/// Environment variable consulted for the InfluxDB token
pub const INFLUX_TOKEN_ENV: &str = "UMR_INFLUXDB_TOKEN";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SinkError {
    #[error("Time-series sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for one data point per successful run
#[async_trait::async_trait]
pub trait TimeSeriesSink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(
        &self,
        reading: &Reading,
        meter_name: &str,
        meter_type: MeterType,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError>;
}

/// Used when no time-series database is configured
///
/// Accepts and drops every point; a deliberately disabled sink is not a
/// failure.
pub struct DisabledSink;

#[async_trait::async_trait]
impl TimeSeriesSink for DisabledSink {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn write(
        &self,
        _reading: &Reading,
        meter_name: &str,
        _meter_type: MeterType,
        _timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        debug!(meter = %meter_name, "Time-series sink disabled, point dropped");
        Ok(())
    }
}

/// InfluxDB v2 line-protocol writer
pub struct InfluxSink {
    http_client: reqwest::Client,
    url: String,
    org: String,
    bucket: String,
    token: Option<String>,
    measurement: String,
}

impl InfluxSink {
    pub fn new(
        url: &str,
        org: &str,
        bucket: &str,
        token: Option<String>,
        measurement: &str,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        Ok(Self {
            http_client,
            url: url.trim_end_matches('/').to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            token,
            measurement: measurement.to_string(),
        })
    }

    pub fn from_section(section: &InfluxSection, timeout: Duration) -> Result<Self, SinkError> {
        let token = resolve_secret(INFLUX_TOKEN_ENV, section.token.as_deref(), "InfluxDB token");
        Self::new(
            &section.url,
            &section.org,
            &section.bucket,
            token,
            &section.measurement,
            timeout,
        )
    }
}

#[async_trait::async_trait]
impl TimeSeriesSink for InfluxSink {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn write(
        &self,
        reading: &Reading,
        meter_name: &str,
        meter_type: MeterType,
        timestamp: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        let line = line_protocol(&self.measurement, reading, meter_name, meter_type, timestamp);
        debug!(meter = %meter_name, line = %line, "Writing InfluxDB point");

        let mut request = self
            .http_client
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(line);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Unavailable(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        Ok(())
    }
}

/// Render one reading as an InfluxDB line-protocol point (second precision)
pub fn line_protocol(
    measurement: &str,
    reading: &Reading,
    meter_name: &str,
    meter_type: MeterType,
    timestamp: DateTime<Utc>,
) -> String {
    let mut fields = vec![
        format!("total_reading={}", reading.total_reading()),
        format!("digital_reading={}i", reading.digital_component()),
    ];
    if let Some(sub_unit) = reading.sub_unit_component() {
        fields.push(format!("sub_unit_reading={}i", sub_unit));
    }
    if let Some(dial) = reading.dial_component() {
        fields.push(format!("dial_reading={}", dial));
    }

    format!(
        "{},meter={},meter_type={},confidence={} {} {}",
        escape(measurement, false),
        escape(meter_name, true),
        meter_type,
        reading.confidence(),
        fields.join(","),
        timestamp.timestamp()
    )
}

/// Escape measurement names (commas, spaces) and tag values (also `=`)
fn escape(value: &str, is_tag: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == ',' || c == ' ' || (is_tag && c == '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
