//! Domain types shared by the rarcrack API server and worker.
//!
//! Holds the task record and its status machine, the live notification
//! events, validation rules for new jobs, and the [`store::TaskStore`]
//! seam that both processes coordinate through.

pub mod error;
pub mod job_events;
pub mod store;
pub mod task;
pub mod types;
