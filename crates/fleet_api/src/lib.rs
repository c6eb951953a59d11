//! Fleet API Library
//!
//! HTTP surface of the EV charging fleet controller: station listing, operator
//! configuration, firmware upload and server-sent fleet events.

mod events;
mod firmware;
mod station;

pub use events::{subscribe, unsubscribe};
pub use firmware::{
    PushFirmwareRequest, PushFirmwareResponse, UploadFirmwareRequest, UploadFirmwareResponse,
};
pub use station::{ConfigResponse, SetModeRequest, SetPriorityRequest, SetRateLimitRequest};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};
use fleet_engine::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub type AppState = Arc<Engine>;

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Create the application router with all endpoints
pub fn create_app(engine: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stations", get(station::list_stations))
        .route("/stations/{station_id}/mode", put(station::set_mode))
        .route("/stations/{station_id}/priority", put(station::set_priority))
        .route(
            "/stations/{station_id}/rate-limit",
            put(station::set_rate_limit),
        )
        .route(
            "/stations/{station_id}/firmware",
            post(firmware::push_firmware),
        )
        .route(
            "/firmware",
            post(firmware::upload_firmware)
                .layer(DefaultBodyLimit::max(firmware::MAX_FIRMWARE_BODY)),
        )
        .route(
            "/events/{subscription_id}",
            get(events::subscribe).delete(events::unsubscribe),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use fleet_core::price::AlwaysFavorable;
    use fleet_core::{CurrentLimits, FleetSnapshot, StationConfig};
    use fleet_engine::EngineSettings;
    use fleet_engine::firmware::MemoryFirmwareStore;
    use fleet_engine::persistence::{KeyValueStore, MemoryStore};
    use fleet_engine::registry::FleetRegistry;
    use tower::util::ServiceExt;

    /// Engine whose registry already knows `station_ids`, all offline.
    pub(crate) fn test_engine(station_ids: &[&str]) -> AppState {
        test_engine_on(Arc::new(MemoryStore::new()), station_ids)
    }

    pub(crate) fn test_engine_on(store: Arc<dyn KeyValueStore>, station_ids: &[&str]) -> AppState {
        let limits = CurrentLimits::default();
        for station_id in station_ids {
            store
                .put(
                    &format!("evCharging.station.{station_id}"),
                    serde_json::to_value(StationConfig::initial(&limits)).unwrap(),
                )
                .unwrap();
        }
        let registry = Arc::new(FleetRegistry::open(store, limits).unwrap());
        Arc::new(Engine::new(
            registry,
            Arc::new(AlwaysFavorable),
            Arc::new(MemoryFirmwareStore::new()),
            EngineSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_app(test_engine(&[]));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_integration_configure_and_list() {
        let app = create_app(test_engine(&["C1", "C2"]));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/stations/C2/priority")
                    .method("PUT")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_string(&SetPriorityRequest {
                            load_sharing_priority: 1,
                        })
                        .unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stations")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: FleetSnapshot = serde_json::from_slice(&body).unwrap();
        let priorities: Vec<(String, u8)> = snapshot
            .stations
            .iter()
            .map(|s| (s.client_id.clone(), s.config.load_sharing_priority))
            .collect();
        assert_eq!(priorities, vec![("C1".into(), 5), ("C2".into(), 1)]);
    }
}
