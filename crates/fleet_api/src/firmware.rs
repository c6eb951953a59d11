use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use fleet_engine::FirmwarePushError;
use fleet_engine::firmware::FirmwareError;
use fleet_engine::session::SessionError;
use serde::{Deserialize, Serialize};

use crate::{AppState, ErrorResponse};

/// Uploaded images may be much larger than axum's default body limit.
pub const MAX_FIRMWARE_BODY: usize = 64 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFirmwareRequest {
    /// Base64 encoded image
    pub data: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFirmwareResponse {
    pub version: String,
    pub size: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushFirmwareRequest {
    pub version: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushFirmwareResponse {
    pub station_id: String,
    pub version: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn firmware_error_status(error: &FirmwareError) -> StatusCode {
    match error {
        FirmwareError::Empty | FirmwareError::InvalidVersion { .. } => StatusCode::BAD_REQUEST,
        FirmwareError::NotFound { .. } => StatusCode::NOT_FOUND,
        FirmwareError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn push_error_to_response(error: FirmwarePushError) -> impl IntoResponse {
    let status = match &error {
        FirmwarePushError::UnknownStation { .. } => StatusCode::NOT_FOUND,
        FirmwarePushError::NotConnected { .. } => StatusCode::CONFLICT,
        FirmwarePushError::Firmware(e) => firmware_error_status(e),
        FirmwarePushError::Session(SessionError::FirmwareTransferInProgress { .. }) => {
            StatusCode::CONFLICT
        }
        FirmwarePushError::Session(
            SessionError::EmptyFirmware | SessionError::FirmwareTooLarge { .. },
        ) => StatusCode::BAD_REQUEST,
        FirmwarePushError::Session(_) => StatusCode::BAD_GATEWAY,
    };
    error_response(status, error)
}

pub async fn upload_firmware(
    State(engine): State<AppState>,
    Json(payload): Json<UploadFirmwareRequest>,
) -> impl IntoResponse {
    let image = match STANDARD.decode(payload.data.as_bytes()) {
        Ok(image) => image,
        Err(e) => {
            tracing::warn!("Rejected firmware upload: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Firmware data is not valid base64: {e}"),
            );
        }
    };
    let size = image.len();

    match engine.store_firmware(image).await {
        Ok(version) => (
            StatusCode::CREATED,
            Json(UploadFirmwareResponse { version, size }),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Could not store firmware: {}", e);
            error_response(firmware_error_status(&e), e)
        }
    }
}

/// Runs the whole transfer before answering.
pub async fn push_firmware(
    State(engine): State<AppState>,
    Path(station_id): Path<String>,
    Json(payload): Json<PushFirmwareRequest>,
) -> impl IntoResponse {
    match engine.push_firmware(&station_id, &payload.version).await {
        Ok(()) => (
            StatusCode::OK,
            Json(PushFirmwareResponse {
                station_id,
                version: payload.version,
            }),
        )
            .into_response(),
        Err(e) => push_error_to_response(e).into_response(),
    }
}
