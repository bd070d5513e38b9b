//! Spend and rate accounting: shared counters, over-quota markers, the
//! admission validator and the recorder the event consumer writes through.

pub mod access;
pub mod counters;
pub mod recorder;
pub mod redis_store;
pub mod validator;

pub use access::{AccessCache, BlockKind, MemoryAccessCache};
pub use counters::{Clock, CounterError, CounterStore, MemoryCounters, SystemClock};
pub use recorder::Recorder;
pub use redis_store::RedisCounters;
pub use validator::{PolicyViolation, Validator};
