//! Time-series publishing: measurement points and the HTTP write path.
//!
//! The stats collector produces [`Point`]s; a [`PointSink`] delivers them.
//! The real sink renders InfluxDB line protocol and POSTs it to the v2
//! write endpoint with a synchronous acknowledgement. Writes are batched by
//! the caller; a failed write is surfaced but never retried within a
//! scrape.

use crate::config::TimeSeriesConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use url::Url;

/// One measurement point: a measurement name, a tag set and a field set
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    /// Measurement name, e.g. `Bandwidth`
    pub measurement: String,
    /// Tag set (indexed dimensions)
    pub tags: BTreeMap<String, String>,
    /// Field set (values); all emitted fields are floats
    pub fields: BTreeMap<String, f64>,
}

impl Point {
    /// Start a point for `measurement`
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a tag
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a field
    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Render the point as one line of InfluxDB line protocol (no
    /// timestamp; the store assigns receipt time)
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_tag(key));
            line.push('=');
            line.push_str(&escape_tag(value));
        }
        line.push(' ');
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape_tag(key), value))
            .collect();
        line.push_str(&fields.join(","));
        line
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Write point for derived time-series
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Deliver one batch of points, acknowledged synchronously
    async fn write_points(&self, points: &[Point]) -> Result<()>;
}

/// HTTP sink for an InfluxDB-v2-compatible write endpoint
pub struct InfluxWriter {
    client: reqwest::Client,
    write_url: Url,
    token: String,
}

impl InfluxWriter {
    /// Build a writer from the time-series config.
    ///
    /// Fails when the configured base URL does not parse; org and bucket
    /// are carried as query parameters on the write endpoint.
    pub fn new(config: &TimeSeriesConfig) -> Result<Self> {
        let base = format!("{}/", config.url.trim_end_matches('/'));
        let mut write_url = Url::parse(&base)
            .and_then(|base| base.join("api/v2/write"))
            .map_err(|e| Error::Config {
                message: format!("invalid time-series URL '{}': {e}", config.url),
                key: Some("time_series.url".to_string()),
            })?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");
        Ok(Self {
            client: reqwest::Client::new(),
            write_url,
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl PointSink for InfluxWriter {
    async fn write_points(&self, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");
        let mut request = self.client.post(self.write_url.clone()).body(body);
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("Token {}", self.token));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Publisher(format!(
                "write endpoint returned {status}: {detail}"
            )));
        }
        Ok(())
    }
}

/// Sink that keeps points in memory; used for tests and simulated runs
#[derive(Default)]
pub struct MemorySink {
    points: Mutex<Vec<Point>>,
}

impl MemorySink {
    /// A fresh empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// All points written so far, across batches
    pub fn points(&self) -> Vec<Point> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PointSink for MemorySink {
    async fn write_points(&self, points: &[Point]) -> Result<()> {
        if let Ok(mut stored) = self.points.lock() {
            stored.extend_from_slice(points);
        }
        Ok(())
    }
}
