//! Canonical event topic constants shared by the server and its clients.
//!
//! Keep this list grouped by area and favor dot.case names.

// Desired state / queue
pub const TOPIC_CONFIG_PATCHED: &str = "config.patched";
pub const TOPIC_CONFIG_BASELINE_SAVED: &str = "config.baseline.saved";
pub const TOPIC_QUEUE_UPDATED: &str = "queue.updated";
pub const TOPIC_QUEUE_CLEARED: &str = "queue.cleared";
pub const TOPIC_QUEUE_APPLIED: &str = "queue.applied";

// Apply engine
pub const TOPIC_APPLY_OPERATION_COMPLETED: &str = "apply.operation.completed";
pub const TOPIC_APPLY_OPERATION_FAILED: &str = "apply.operation.failed";

// Ports
pub const TOPIC_PORT_ASSIGNED: &str = "ports.assigned";
pub const TOPIC_PORT_RELEASED: &str = "ports.released";

// Services
pub const TOPIC_SERVICE_STATE_CHANGED: &str = "service.state.changed";
pub const TOPIC_SERVICE_RESTART_EXHAUSTED: &str = "service.restart.exhausted";
pub const TOPIC_SERVICE_LOG: &str = "service.log";

// System restart choreography
pub const TOPIC_SYSTEM_RESTART_PHASE: &str = "system.restart.phase";
pub const TOPIC_SYSTEM_RESTART_FINISHED: &str = "system.restart.finished";
