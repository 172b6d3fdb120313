use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use hearth_events::Envelope;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::AppState;

fn parse_prefixes(q: &HashMap<String, String>) -> Vec<String> {
    q.get("prefix")
        .map(|s| {
            s.split(',')
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(|p| p.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn wanted(prefixes: &[String], env: &Envelope) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|p| env.kind.starts_with(p.as_str()))
}

/// Server-Sent Events stream of bus envelopes.
#[utoipa::path(
    get,
    path = "/events",
    tag = "Events",
    params(("prefix" = Option<String>, Query, description = "CSV of event kind prefixes to include")),
    responses((status = 200, description = "SSE stream of events", content_type = "text/event-stream"))
)]
pub async fn events_sse(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let prefixes = parse_prefixes(&q);
    let stream = BroadcastStream::new(state.bus().subscribe()).filter_map(move |item| {
        // Lagged receivers skip what they missed.
        let env = item.ok()?;
        if !wanted(&prefixes, &env) {
            return None;
        }
        let event = Event::default()
            .event(env.kind.clone())
            .json_data(&env)
            .ok()?;
        Some(Ok(event))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
