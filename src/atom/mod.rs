pub mod tracker;
pub mod types;

pub use tracker::TaskTracker;
pub use types::{AtomSession, AtomStatus, CreateTaskRequest, TransitionTaskRequest};
