pub mod gc;
pub mod store;
pub mod types;

pub use gc::{OrphanSweeper, run_gc_worker};
pub use store::{ContextStream, KnowledgeSettings, KnowledgeStore};
pub use types::{
    BLOB_PREFIX, ContextEntry, ContextFilter, StoreContextRequest, SweepReport,
    UpdateMetadataRequest, blob_key_for,
};
