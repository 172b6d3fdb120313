pub mod config;
pub mod events;
pub mod health;
pub mod queue;
pub mod services;
pub mod system;

use hearth_core::QueuedChangeSet;
use serde::Serialize;

use crate::AppState;

/// Queue state as the API returns it after every read or edit.
#[derive(Clone, Debug, Serialize)]
pub struct QueueView {
    pub queue: Option<QueuedChangeSet>,
    pub apply_running: bool,
}

impl QueueView {
    pub(crate) fn new(state: &AppState, queue: Option<QueuedChangeSet>) -> Self {
        Self {
            queue,
            apply_running: state.apply().is_busy(),
        }
    }
}

/// Publish the edited queue (or its absence) and wrap it for the response.
pub(crate) fn queue_edited(state: &AppState, queue: Option<QueuedChangeSet>) -> QueueView {
    let view = QueueView::new(state, queue);
    match view.queue.as_ref() {
        Some(cs) => state.bus().publish(
            hearth_topics::TOPIC_QUEUE_UPDATED,
            &serde_json::json!({"operations": cs.operations, "created_at": cs.created_at}),
        ),
        None => state
            .bus()
            .publish(hearth_topics::TOPIC_QUEUE_CLEARED, &serde_json::json!({})),
    }
    view
}
