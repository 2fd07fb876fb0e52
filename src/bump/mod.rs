pub mod broker;
pub mod types;

pub use broker::{HandoffBroker, MarkerOutcome};
pub use types::{
    AcknowledgeMarkerRequest, BumpMarker, CreateMarkerRequest, MarkerStatus, MarkerType,
    ResolveMarkerRequest,
};
