//! Server-Sent Events push channel for live subscribers.
//!
//! Each subscriber gets the current snapshot immediately, then every
//! `snapshot` and `alert` event as it is broadcast. A subscriber that falls
//! behind the broadcast buffer skips the events it missed.

use crate::metrics::SUBSCRIBERS;
use crate::rest::AppState;
use crate::store::StreamEvent;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Decrements the subscriber gauge when the SSE stream is dropped.
struct SubscriberGuard {
    id: Uuid,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        SUBSCRIBERS.dec();
        info!("Subscriber {} disconnected", self.id);
    }
}

pub async fn subscribe(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before reading the snapshot so nothing slips between them.
    let rx = state.store.subscribe();
    let initial = StreamEvent::Snapshot(state.store.snapshot());

    let guard = SubscriberGuard { id: Uuid::new_v4() };
    SUBSCRIBERS.inc();
    info!("Subscriber {} connected", guard.id);

    let live = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(event),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!("Subscriber lagged, skipped {} events", skipped);
            None
        }
    });

    let events = tokio_stream::once(initial)
        .chain(live)
        .filter_map(move |event| {
            let _subscriber = &guard;
            to_sse_event(&event)
        })
        .map(Ok);

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("ping"),
    )
}

fn to_sse_event(event: &StreamEvent) -> Option<Event> {
    let result = match event {
        StreamEvent::Snapshot(snapshot) => Event::default().event("snapshot").json_data(snapshot),
        StreamEvent::Alert(alert) => Event::default().event("alert").json_data(alert),
    };

    result
        .map_err(|e| warn!("Failed to encode stream event: {}", e))
        .ok()
}
