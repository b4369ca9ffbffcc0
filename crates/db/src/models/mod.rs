//! Row models mapping database tables to Rust structs.

pub mod task;
