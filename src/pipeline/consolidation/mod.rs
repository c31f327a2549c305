//! Record consolidation: turns untrusted oracle proposals into deduplicated,
//! lineage-tracked canonical entities.
//!
//! ```text
//! request → load existing → oracle → parse/quarantine
//!         → for each change: resolve (id → lineage → structural → recovery)
//!                            → apply (one atomic store call)
//!         → audit → BatchSummary
//! ```
//!
//! Batches for the same (patient, entity type) are serialized by the gate;
//! everything else runs in parallel.

pub mod error;
pub mod gate;
pub mod history;
pub mod orchestrator;
pub mod resolver;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod synonyms;
pub mod traits;
pub mod types;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use error::{ApplyFailure, ConsolidationError};
pub use gate::{GateKey, SerializationGate};
pub use orchestrator::Consolidator;
pub use service::ConsolidationService;
pub use store::SqliteCanonicalStore;
pub use traits::CanonicalStore;
pub use types::*;
