//! Distributed backplanes for `groupcast`.
//!
//! A backplane carries one channel per group and multicasts every
//! published envelope to all subscribed processes; exclude/target
//! filtering stays an application-level refinement applied after
//! delivery.

pub mod error;
mod redis_backplane;

pub use error::Error;
pub use redis_backplane::RedisBackplane;
