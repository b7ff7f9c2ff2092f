//! Record store and its change stream.
//!
//! The store maps a decoded item id to its [`ItemRecord`]. Every mutation is
//! scoped to one primary key, so concurrent consumers never need to lock
//! across records. Each successful mutation is also appended to a change
//! stream that downstream consumers read independently of the router.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{ItemFields, ItemRecord};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create or replace the record for `item_id`.
    async fn upsert(&self, item_id: &str, fields: ItemFields) -> Result<ItemRecord>;

    async fn get(&self, item_id: &str) -> Result<Option<ItemRecord>>;

    /// Delete the record, returning its prior state. Deleting an absent
    /// record is not an error.
    async fn delete(&self, item_id: &str) -> Result<Option<ItemRecord>>;

    /// Set the description of an existing record, leaving other fields
    /// untouched. Fails with `NotFound` if the record does not exist.
    async fn set_description(&self, item_id: &str, description: &str) -> Result<ItemRecord>;
}

// ---------------------------------------------------------------------------
// Change stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Remove,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Remove => "remove",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Operation {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "remove" => Ok(Operation::Remove),
            other => Err(crate::error::Error::Other(format!(
                "unknown change operation: {other}"
            ))),
        }
    }
}

/// One entry in the change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Strictly increasing position in the stream.
    pub sequence: u64,
    pub operation: Operation,
    pub before: Option<ItemRecord>,
    pub after: Option<ItemRecord>,
    pub recorded_at: DateTime<Utc>,
}

/// Where a reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPosition {
    /// The oldest retained change.
    TrimHorizon,
    /// Only changes recorded after the reader starts.
    Latest,
    /// Changes with a sequence strictly greater than this one.
    After(u64),
}

#[async_trait]
pub trait ChangeStream: Send + Sync {
    /// Read up to `limit` changes with `sequence > after`, oldest first.
    async fn read_after(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Sequence of the newest change, or 0 if there is none.
    async fn latest_sequence(&self) -> Result<u64>;

    /// Drop changes recorded before `horizon`. Returns how many went.
    async fn trim(&self, horizon: DateTime<Utc>) -> Result<u64>;

    /// Turn a starting position into a concrete cursor.
    async fn resolve(&self, position: StreamPosition) -> Result<u64> {
        match position {
            StreamPosition::TrimHorizon => Ok(0),
            StreamPosition::Latest => self.latest_sequence().await,
            StreamPosition::After(sequence) => Ok(sequence),
        }
    }
}
