//! Field workers and everything that happens on their side of an offer.
//!
//! - **Directory**: registration, online/offline, location pings and task
//!   history ([`WorkerDirectory`])
//! - **Alerts**: repeated offer notifications while an offer is open
//!   ([`AlertDispatcher`])
//! - **Completion**: closing out or abandoning accepted jobs
//!   ([`CompletionHandler`])
//!
//! # Worker lifecycle
//!
//! ```text
//! OFFLINE <-> IDLE -> OFFERED -> BUSY
//!              ^         |        |
//!              +---------+--------+
//! ```
//!
//! `active_job_id` is set exactly while a worker is OFFERED or BUSY. Only the
//! offer scheduler and the completion handler move a worker out of IDLE or
//! back into it; the worker itself can only toggle OFFLINE and IDLE.

pub mod alert;
pub mod completion;
pub mod directory;

pub use alert::{AlertDispatcher, BroadcastNotifier, LogNotifier, Notifier, OfferNotification};
pub use completion::{Completion, CompletionHandler};
pub use directory::{
    Candidate, HistoryEntry, TaskOutcome, Worker, WorkerDirectory, WorkerId, WorkerStatus,
};
