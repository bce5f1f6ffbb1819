//! Request/reply worker pool
//!
//! An elastic pool serving outbound request/response transactions over the
//! broker. Each worker owns a private server-named reply queue bound to the
//! targeted exchange and carries exactly one request at a time; the pool
//! scales up on demand and trims back toward its baseline on a periodic
//! tick. Workers are reused first-in-first-out so sustained load spreads
//! evenly.

mod config;
mod coordinator;
mod request;
mod worker;

pub use config::PoolConfig;
pub use coordinator::{Pool, PoolHandle, PoolStats};
pub use request::CallKind;
