//! SSE framing
//!
//! Each `AnswerEvent` becomes one SSE frame: an `event:` line with the kind
//! and `data:` lines carrying the JSON payload. Keep-alive comment frames
//! are injected by axum's `KeepAlive` at the configured interval.

use axum::response::sse::Event;
use std::convert::Infallible;

use quarry_core::AnswerEvent;

/// Convert a pipeline event into an SSE frame
pub fn to_sse_event(event: &AnswerEvent) -> Result<Event, Infallible> {
    let frame = Event::default().event(event.kind());
    match frame.json_data(event) {
        Ok(frame) => Ok(frame),
        Err(e) => {
            // Serialization of our own types failing is a bug; emit a
            // well-formed fallback frame rather than corrupting the stream
            tracing::error!(error = %e, kind = event.kind(), "Failed to serialize SSE event");
            Ok(Event::default()
                .event("fallback")
                .data("{\"type\":\"fallback\",\"reason\":\"internal\",\"partial\":\"\"}"))
        }
    }
}
