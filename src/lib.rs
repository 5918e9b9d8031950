//! emberdb is a schemaless, versioned document store engine. Writes are
//! immutable revisions appended to a durable buffer and migrated into
//! sorted, bloom-indexed block files; presence is derived from
//! revision-count parity, which makes every read time-travelable for free.
//! Three parallel indexes (primary, secondary, full-text search) stay
//! mutually consistent, and a token lock service underpins both autocommit
//! atomicity and optimistic multi-operation transactions.

pub mod error;

pub mod buffer;
pub mod config;
pub mod db;
pub mod engine;
pub mod flock;
pub mod lock;
pub mod model;
pub mod pool;
pub mod storage;
pub mod time;
pub mod transaction;

pub use config::EngineConfig;
pub use engine::{Engine, Operator};
pub use error::{Error, Result};
pub use model::{Datum, PrimaryKey, Text, Value};
pub use time::Timestamp;
pub use transaction::Transaction;
