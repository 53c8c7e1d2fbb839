pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::{InMemoryAuditLedger, InMemoryTableStore, MemorySnapshot};
pub use record::{
    CommitInfo, ExecutionFilter, ExecutionOutcome, ExecutionRecord, ExecutionStatus, Namespace,
    RowKey, StoredRow, TableRef, TableState, Zone,
};
pub use traits::{AuditLedger, TableStore};
