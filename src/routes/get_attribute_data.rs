use axum::{extract::Query, extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::forecast::{NaiveForecaster, DEFAULT_HORIZON};
use crate::query::{parse_query_date, run_query, AttributeQuery, QueryError};
use crate::store::Store;
use crate::Config;

// ---

pub fn router<S>() -> Router<(S, Config)>
where
    S: Store + Clone + 'static,
{
    // ---
    Router::new().route("/data", get(handler::<S>))
}

async fn handler<S>(Query(params): Query<DataParams>, State((store, config)): State<(S, Config)>) -> impl IntoResponse
where
    S: Store + Clone + 'static,
{
    // ---
    info!("GET /data - {:?}", params);

    if params.attributedata.is_none() {
        if let Some(names) = params.attribute.as_deref().map(split_names) {
            return match store.find_attributes_by_names(&names).await {
                Ok(attributes) => (StatusCode::OK, Json(json!(attributes))).into_response(),
                Err(e) => {
                    error!("Failed to list attributes: {}", e);
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "error occurred while processing request")
                }
            };
        }
    }

    let query = match params.to_query(config.query_default_limit) {
        Ok(Some(query)) => query,
        Ok(None) => return error_response(StatusCode::BAD_REQUEST, "error occurred while processing request"),
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    match run_query(&store, &query, &NaiveForecaster).await {
        Ok(response) => {
            debug!("GET /data - {} attributes", response.attributes.len());
            (StatusCode::OK, Json(json!(response))).into_response()
        }
        Err(e) => {
            error!("Query failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
        .collect()
}

/// Query string of `GET /data`.
#[derive(Debug, Default, Deserialize)]
pub struct DataParams {
    /// Comma-separated attribute names whose data is requested.
    attributedata: Option<String>,
    /// Comma-separated attribute names whose metadata is listed.
    attribute: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    fromdate: Option<String>,
    todate: Option<String>,
    operation: Option<String>,
    grouped: Option<bool>,
    freq: Option<String>,
    per_sensor: Option<bool>,
    harmonising_method: Option<String>,
    sensorid: Option<String>,
    predictions: Option<bool>,
    n_predictions: Option<usize>,
}

impl DataParams {
    /// `Ok(None)` when no attribute data was requested.
    fn to_query(&self, default_limit: i64) -> Result<Option<AttributeQuery>, QueryError> {
        // ---
        let Some(names) = self.attributedata.as_deref().map(split_names) else {
            return Ok(None);
        };

        let mut query = AttributeQuery::new(names);
        query.limit = self.limit.unwrap_or(default_limit).max(0);
        query.offset = self.offset.unwrap_or(0).max(0);
        query.from_date = self.fromdate.as_deref().map(|d| parse_query_date(d, false)).transpose()?;
        query.to_date = self.todate.as_deref().map(|d| parse_query_date(d, true)).transpose()?;
        query.operation = self.operation.as_deref().map(str::parse).transpose()?;
        query.grouped = self.grouped.unwrap_or(false);
        if let Some(freq) = self.freq.as_deref() {
            query.frequency = freq.parse()?;
        }
        query.per_sensor = self.per_sensor.unwrap_or(false);
        query.harmonising_method = self.harmonising_method.as_deref().map(str::parse).transpose()?;
        query.sensor_id = self
            .sensorid
            .as_deref()
            .map(|id| Uuid::parse_str(id.trim()).map_err(|_| QueryError::InvalidSensorId(id.to_string())))
            .transpose()?;
        query.predict = self.predictions.unwrap_or(false);
        query.prediction_horizon = self.n_predictions.unwrap_or(DEFAULT_HORIZON);

        Ok(Some(query))
    }
}
