//! Reconciliation and background scheduling.
//!
//! - [`reconcile`]: differential sync between remote snapshots and the
//!   metadata store
//! - [`scheduler`]: cooperative periodic driving with host-signal gating

pub mod reconcile;
pub mod scheduler;

pub use reconcile::*;
pub use scheduler::*;
