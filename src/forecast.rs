//! Boundary to the forecasting model.
//!
//! The model itself is a black box behind [`Forecaster`]. This module owns
//! the eligibility guard and the shape of the block appended to query
//! results. [`NaiveForecaster`] is the built-in stand-in.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ---

/// Fewer qualifying observations than this yields [`ForecastOutcome::InsufficientData`].
pub const MIN_OBSERVATIONS: usize = 100;

/// Upper bound on rows read for one forecast.
pub const MAX_FORECAST_ROWS: i64 = 10_000;

pub const DEFAULT_HORIZON: usize = 100;

/// Label used when the forecast spans every sensor.
pub const ALL_SENSORS: &str = "All sensors";

const NOT_ENOUGH_DATA: &str = "not enough data";

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("series has {values} values but {timestamps} timestamps")]
    LengthMismatch { values: usize, timestamps: usize },

    #[error("forecast model failed: {0}")]
    Model(String),
}

/// Output of one model run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub predictions: Vec<f64>,
    pub mape: f64,
    pub method: String,
}

pub trait Forecaster: Send + Sync {
    fn forecast(
        &self,
        values: &[f64],
        timestamps: &[DateTime<Utc>],
        horizon: usize,
    ) -> Result<Prediction, ForecastError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ForecastOutcome {
    Forecast {
        sensor_id: String,
        method: String,
        mape: f64,
        predictions: Vec<f64>,
    },
    InsufficientData {
        predictions: String,
    },
}

impl ForecastOutcome {
    pub fn is_forecast(&self) -> bool {
        matches!(self, ForecastOutcome::Forecast { .. })
    }
}

/// Run `forecaster` over a series if it is long enough.
pub fn forecast_series(
    forecaster: &dyn Forecaster,
    sensor_label: &str,
    values: &[f64],
    timestamps: &[DateTime<Utc>],
    horizon: usize,
) -> Result<ForecastOutcome, ForecastError> {
    // ---
    if values.len() != timestamps.len() {
        return Err(ForecastError::LengthMismatch {
            values: values.len(),
            timestamps: timestamps.len(),
        });
    }
    if values.len() < MIN_OBSERVATIONS {
        tracing::info!(
            "Not forecasting {}: {} observations, need {}",
            sensor_label,
            values.len(),
            MIN_OBSERVATIONS
        );
        return Ok(ForecastOutcome::InsufficientData {
            predictions: NOT_ENOUGH_DATA.to_string(),
        });
    }

    let prediction = forecaster.forecast(values, timestamps, horizon)?;
    tracing::debug!(
        "Forecast for {} with {}: mape {:.3}",
        sensor_label,
        prediction.method,
        prediction.mape
    );

    Ok(ForecastOutcome::Forecast {
        sensor_id: sensor_label.to_string(),
        method: prediction.method,
        mape: prediction.mape,
        predictions: prediction.predictions,
    })
}

/// Persistence model: every future step repeats the last observation.
///
/// MAPE is the one-step-ahead backtest over the history, skipping zero
/// actuals.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveForecaster;

impl Forecaster for NaiveForecaster {
    fn forecast(
        &self,
        values: &[f64],
        _timestamps: &[DateTime<Utc>],
        horizon: usize,
    ) -> Result<Prediction, ForecastError> {
        // ---
        let last = values
            .last()
            .copied()
            .ok_or_else(|| ForecastError::Model("empty series".into()))?;

        let errors: Vec<f64> = values
            .windows(2)
            .filter(|w| w[1] != 0.0)
            .map(|w| ((w[1] - w[0]) / w[1]).abs())
            .collect();
        let mape = if errors.is_empty() {
            0.0
        } else {
            100.0 * errors.iter().sum::<f64>() / errors.len() as f64
        };

        Ok(Prediction {
            predictions: vec![last; horizon],
            mape,
            method: "naive_persistence".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};

    fn series(n: usize) -> (Vec<f64>, Vec<DateTime<Utc>>) {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let values = (0..n).map(|i| 10.0 + (i % 5) as f64).collect();
        let stamps = (0..n).map(|i| base + Duration::hours(i as i64)).collect();
        (values, stamps)
    }

    #[test]
    fn test_fifty_observations_is_not_enough() {
        // ---
        let (values, stamps) = series(50);
        let out = forecast_series(&NaiveForecaster, ALL_SENSORS, &values, &stamps, 10).unwrap();

        assert_eq!(
            out,
            ForecastOutcome::InsufficientData {
                predictions: "not enough data".into()
            }
        );
    }

    #[test]
    fn test_one_hundred_fifty_observations_forecasts() {
        // ---
        let (values, stamps) = series(150);
        let out = forecast_series(&NaiveForecaster, ALL_SENSORS, &values, &stamps, 24).unwrap();

        let ForecastOutcome::Forecast {
            sensor_id,
            predictions,
            mape,
            method,
        } = out
        else {
            panic!("expected a forecast");
        };
        assert_eq!(sensor_id, ALL_SENSORS);
        assert_eq!(predictions.len(), 24);
        assert!(predictions.iter().all(|p| *p == values[149]));
        assert!(mape > 0.0);
        assert_eq!(method, "naive_persistence");
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        // ---
        let (values, mut stamps) = series(120);
        stamps.pop();
        assert!(matches!(
            forecast_series(&NaiveForecaster, ALL_SENSORS, &values, &stamps, 1),
            Err(ForecastError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_constant_series_has_zero_mape() {
        // ---
        let p = NaiveForecaster.forecast(&[3.0; 5], &[], 2).unwrap();
        assert_eq!(p.mape, 0.0);
        assert_eq!(p.predictions, vec![3.0, 3.0]);
    }
}
