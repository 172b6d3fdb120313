pub mod client;
pub mod queue;
pub mod restart;
pub mod service;
pub mod status;

pub use client::{ClientArgs, HubClient};
pub use queue::QueueCmd;
pub use restart::RestartArgs;
pub use service::ServiceCmd;
pub use status::StatusArgs;
