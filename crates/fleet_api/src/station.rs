use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use fleet_core::{ChargingMode, FleetSnapshot, StationConfig};
use fleet_engine::Engine;
use fleet_engine::registry::RegistryError;
use serde::{Deserialize, Serialize};

use crate::{AppState, ErrorResponse};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModeRequest {
    pub mode: ChargingMode,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPriorityRequest {
    pub load_sharing_priority: u8,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRateLimitRequest {
    pub charge_rate_limit_amps: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub station_id: String,
    pub config: StationConfig,
}

pub(crate) fn registry_error_to_response(error: RegistryError) -> impl IntoResponse {
    let status = match &error {
        RegistryError::UnknownStation { .. } => StatusCode::NOT_FOUND,
        RegistryError::Config(_) => StatusCode::BAD_REQUEST,
        RegistryError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::Persistence(_) | RegistryError::SessionSuperseded { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn config_response(
    station_id: String,
    result: Result<StationConfig, RegistryError>,
) -> axum::response::Response {
    match result {
        Ok(config) => (StatusCode::OK, Json(ConfigResponse { station_id, config })).into_response(),
        Err(error) => {
            tracing::warn!("Config change for {} rejected: {}", station_id, error);
            registry_error_to_response(error).into_response()
        }
    }
}

/// Config changes are written to disk, so they run on the blocking pool.
async fn update_config<F>(
    engine: AppState,
    station_id: String,
    update: F,
) -> axum::response::Response
where
    F: FnOnce(&Engine, &str) -> Result<StationConfig, RegistryError> + Send + 'static,
{
    let result = {
        let station_id = station_id.clone();
        tokio::task::spawn_blocking(move || update(&engine, &station_id)).await
    };
    match result {
        Ok(result) => config_response(station_id, result),
        Err(e) => {
            tracing::error!("Config change for {} did not complete: {}", station_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: format!("Config change for {station_id} did not complete"),
                }),
            )
                .into_response()
        }
    }
}

/// All known stations with telemetry, configuration and current decision
pub async fn list_stations(State(engine): State<AppState>) -> Json<FleetSnapshot> {
    tracing::debug!("Listing stations");
    Json(engine.list_stations())
}

pub async fn set_mode(
    State(engine): State<AppState>,
    Path(station_id): Path<String>,
    Json(payload): Json<SetModeRequest>,
) -> impl IntoResponse {
    update_config(engine, station_id, move |engine, station_id| {
        engine.set_mode(station_id, payload.mode)
    })
    .await
}

pub async fn set_priority(
    State(engine): State<AppState>,
    Path(station_id): Path<String>,
    Json(payload): Json<SetPriorityRequest>,
) -> impl IntoResponse {
    update_config(engine, station_id, move |engine, station_id| {
        engine.set_priority(station_id, payload.load_sharing_priority)
    })
    .await
}

pub async fn set_rate_limit(
    State(engine): State<AppState>,
    Path(station_id): Path<String>,
    Json(payload): Json<SetRateLimitRequest>,
) -> impl IntoResponse {
    update_config(engine, station_id, move |engine, station_id| {
        engine.set_rate_limit(station_id, payload.charge_rate_limit_amps)
    })
    .await
}
