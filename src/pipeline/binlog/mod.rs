//! Binlog Change Capture
//!
//! Reads the source's binary log as a replica and feeds row changes of the
//! migrated tables to the incremental task.

mod client;
mod dumper;
mod event;
mod json;

pub use dumper::MySqlIncrementalDumper;
