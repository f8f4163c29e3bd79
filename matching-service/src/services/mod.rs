//! Service layer for matching-service.

pub mod database;
pub mod decay;
pub mod matching;
pub mod memory;
pub mod metrics;
pub mod scoring;
pub mod store;
pub mod vendor_alias;

pub use database::Database;
pub use decay::{AliasDecayJob, DecaySummary};
pub use matching::{MatchingService, RankedCandidate, UnmatchOutcome};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use store::MatchStore;
