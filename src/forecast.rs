//! Consumed forecast capability.
//!
//! The forecasting model is external. The monitor only builds the hourly
//! people-count series it is fed and relays the predictions.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One hourly observation: mean people count for the hour starting at `timestamp_ms`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp_ms: i64,
    pub value: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPoint {
    pub timestamp_ms: i64,
    pub predicted_value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

pub trait ForecastProvider: Send + Sync {
    fn forecast(&self, series: &[SeriesPoint], horizon_hours: u32) -> Result<Vec<ForecastPoint>>;
}

#[derive(Serialize)]
struct ForecastRequest<'a> {
    series: &'a [SeriesPoint],
    horizon_hours: u32,
}

#[derive(Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    forecast: Vec<ForecastPoint>,
}

/// Forecast service reached over HTTP with a JSON body.
pub struct RemoteForecaster {
    url: String,
    agent: ureq::Agent,
}

impl RemoteForecaster {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl ForecastProvider for RemoteForecaster {
    fn forecast(&self, series: &[SeriesPoint], horizon_hours: u32) -> Result<Vec<ForecastPoint>> {
        if series.is_empty() {
            return Err(anyhow!("no history to forecast from"));
        }
        let body = serde_json::to_value(ForecastRequest {
            series,
            horizon_hours,
        })?;
        let response: ForecastResponse = self
            .agent
            .post(&self.url)
            .send_json(body)
            .with_context(|| format!("POST series to forecaster {}", self.url))?
            .into_json()
            .context("parse forecast response")?;
        Ok(response.forecast)
    }
}
