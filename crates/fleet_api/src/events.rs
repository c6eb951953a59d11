use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::AppState;

/// Stream fleet events to a listener registered under `subscription_id`.
///
/// Subscribing again with the same id replaces the earlier stream. Closing the
/// connection detaches the listener on the next published event.
pub async fn subscribe(
    State(engine): State<AppState>,
    Path(subscription_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = engine.add_listener(&subscription_id);
    let stream = ReceiverStream::new(receiver).map(|message| {
        let event = Event::default()
            .id(message.id.to_string())
            .event(event_name(&message.event));
        Ok(match event.json_data(&message) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Could not encode event {}: {}", message.id, e);
                Event::default().comment("unencodable event")
            }
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn unsubscribe(
    State(engine): State<AppState>,
    Path(subscription_id): Path<String>,
) -> StatusCode {
    engine.remove_listener(&subscription_id);
    StatusCode::NO_CONTENT
}

fn event_name(event: &fleet_core::FleetEvent) -> &'static str {
    use fleet_core::FleetEvent::*;
    match event {
        StationConnected { .. } => "stationConnected",
        StationDisconnected { .. } => "stationDisconnected",
        TelemetryUpdated { .. } => "telemetryUpdated",
        DecisionChanged { .. } => "decisionChanged",
        ConfigChanged { .. } => "configChanged",
        FirmwareTransferFinished { .. } => "firmwareTransferFinished",
    }
}
