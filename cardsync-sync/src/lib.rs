//! # cardsync-sync
//!
//! Identity, change detection, planning and reconciliation engine that keeps
//! flashcards in a remote collection in step with blocks extracted from
//! source documents.
//!
//! Call [`pipeline::run`] to process a batch of blocks, [`reconcile::reconcile`]
//! (or [`reconcile::report`]) to compare the State Store with the remote
//! collection, and [`orphan::detect`] to find tracked cards whose source
//! block is gone.

pub mod error;
pub mod identity;
pub mod marker;
pub mod normalize;
pub mod orphan;
pub mod pipeline;
pub mod planner;
pub mod preview;
pub mod reconcile;
pub mod remote;
pub mod state_store;
mod writer;

pub use error::{RemoteError, SyncError};
pub use identity::Resolution;
pub use pipeline::{run, Outcome, RunOptions, RunReport, Warning};
pub use planner::{Action, ChangeState, DeferReason};
pub use reconcile::{ReconcileMode, ReconcileReport};
pub use remote::{MemoryCollection, RemoteCollection};
pub use state_store::{GenerationEntry, StateStore};
