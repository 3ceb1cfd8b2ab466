//! `ingestq-core`: domain building blocks for the ingestion queue.
//!
//! This crate contains **pure domain** primitives (no storage or runtime concerns).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, ResourceId, WorkerId};
