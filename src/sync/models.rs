//! Sync Data Models - Client-Side Structures
//!
//! Defines the data structures shared by every layer of the sync engine:
//! - ResourceRecord / ResourceMap: cached entities keyed by id
//! - FetchOperations / SendOperations: the outcome of one synchronization run
//! - Token: bearer credential handed out by the token service
//! - Direction: whether a provider pulls or pushes

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// ============================================================================
// Resource Records
// ============================================================================

/// A single synchronizable entity.
///
/// The engine only looks at `id` and `checksum`; everything else is carried
/// in `payload` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,

    /// Opaque version marker. Absent on records created locally and never synced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ResourceRecord {
    /// Record with an id and a checksum, as returned by entity listings
    pub fn new(id: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            checksum: Some(checksum.into()),
            payload: Map::new(),
        }
    }

    /// Record created locally (no checksum yet)
    pub fn local(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            checksum: None,
            payload: Map::new(),
        }
    }

    /// Builder-style payload field setter
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Checksum as a string slice, empty when missing
    pub fn checksum(&self) -> &str {
        self.checksum.as_deref().unwrap_or("")
    }
}

/// Resources keyed by id.
///
/// Ordered so that every list derived from it is deterministic.
pub type ResourceMap = BTreeMap<String, ResourceRecord>;

/// Collect records into a map keyed by their id
pub fn resource_map<I>(records: I) -> ResourceMap
where
    I: IntoIterator<Item = ResourceRecord>,
{
    records
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect()
}

// ============================================================================
// Sync Operations
// ============================================================================

/// Direction of a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Pull remote changes into the local store
    Fetch,
    /// Push local records to the server
    Send,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Fetch => "fetch",
            Direction::Send => "send",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "fetch" => Ok(Direction::Fetch),
            "send" => Ok(Direction::Send),
            _ => Err(format!("Invalid direction: {}", s)),
        }
    }
}

/// Operations computed for (and applied by) a fetch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOperations {
    pub add: Vec<String>,
    pub update: Vec<String>,
    pub remove: Vec<String>,
}

impl FetchOperations {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.add.len() + self.update.len() + self.remove.len()
    }
}

/// Operations applied by a send run.
///
/// `remove` holds the ids deleted locally after a successful push, so it is
/// always a prefix-ordered subset of `send`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOperations {
    pub send: Vec<String>,
    pub remove: Vec<String>,
}

/// Result of one synchronizer run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum SyncReport {
    Fetch(FetchOperations),
    Send(SendOperations),
}

impl SyncReport {
    pub fn direction(&self) -> Direction {
        match self {
            SyncReport::Fetch(_) => Direction::Fetch,
            SyncReport::Send(_) => Direction::Send,
        }
    }

    /// Total number of ids touched by the run
    pub fn changes(&self) -> usize {
        match self {
            SyncReport::Fetch(ops) => ops.len(),
            SyncReport::Send(ops) => ops.send.len(),
        }
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Bearer credential returned by the token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,

    /// Expiry as a UTC epoch timestamp (seconds)
    pub expires: i64,
}

impl Token {
    pub fn is_expired(&self) -> bool {
        self.expires <= Utc::now().timestamp()
    }
}

// ============================================================================
// Tests
// ============================================================================
