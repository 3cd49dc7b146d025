//! Lifecycle event stream over Server-Sent Events.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::http::responses::EventsQuery;
use crate::state::AppState;

/// GET /v1/events - committed task transitions as they happen.
///
/// Each event is named `lifecycle` and carries a JSON `LifecycleEvent`.
/// Subscribers that fall behind receive a comment noting how many events
/// were skipped.
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(task_id = ?query.task_id, "Event subscriber connected");

    let filter = query.task_id;
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(move |item| match item {
        Ok(event) => {
            if filter.as_ref().is_some_and(|id| *id != event.task_id) {
                return None;
            }
            match Event::default().event("lifecycle").json_data(&event) {
                Ok(sse) => Some(Ok(sse)),
                Err(e) => {
                    warn!(error = %e, "Failed to encode lifecycle event");
                    None
                }
            }
        }
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "Event subscriber lagged, skipping events");
            Some(Ok(Event::default().comment(format!("skipped {skipped} events"))))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
