//! Bridges the generator's event channel onto the wire as an SSE response.
//! The generator runs detached: a client disconnect drops this stream and
//! its receiver, which the generator observes as a failed send at its next
//! yield point and enters its finalize path.

use std::time::Duration;

use axum::response::{sse, IntoResponse, Sse};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::agent::types::{Agent, AnswerEvent};

const KEEP_ALIVE_SECS: u64 = 15;

pub fn generate_answer_stream(
    agent: Agent,
    receiver: tokio::sync::mpsc::Receiver<AnswerEvent>,
) -> impl IntoResponse {
    tokio::spawn(agent.run());

    let event_stream = ReceiverStream::new(receiver).map(|event| {
        sse::Event::default()
            .event(event.event_name())
            .json_data(event.payload())
            .map_err(axum::Error::new)
    });

    Sse::new(event_stream).keep_alive(
        sse::KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_SECS))
            .text("keep-alive"),
    )
}

/// A one-shot SSE stream for requests rejected before a generator exists:
/// an `Error` event followed by `End`, so clients tear down cleanly.
pub fn error_stream(error_message: String) -> impl IntoResponse {
    let events = vec![
        AnswerEvent::Error {
            error: error_message,
        },
        AnswerEvent::End,
    ];
    let event_stream = futures::stream::iter(events.into_iter().map(|event| {
        sse::Event::default()
            .event(event.event_name())
            .json_data(event.payload())
            .map_err(axum::Error::new)
    }));
    Sse::new(event_stream)
}
