//! Scan Checkpoints
//!
//! Per-chain scan progress, persisted under `checkpoint:{chain}` so a
//! restarted scanner resumes where the last completed run stopped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::chain::Chain;

/// Storage key of a chain's checkpoint
pub fn checkpoint_key(chain: Chain) -> String {
    format!("checkpoint:{}", chain.as_str().to_lowercase())
}

/// Chain-specific scan position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    /// Last fully scanned block (ETH, BTC)
    BlockHeight(u64),
    /// Last fully scanned validated ledger (XRP)
    LedgerIndex(u64),
    /// Newest processed signature per custody address (SOL)
    Signatures(BTreeMap<String, String>),
}

impl Cursor {
    /// Numeric position, if this cursor has one
    pub fn height(&self) -> Option<u64> {
        match self {
            Cursor::BlockHeight(h) | Cursor::LedgerIndex(h) => Some(*h),
            Cursor::Signatures(_) => None,
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::BlockHeight(h) => write!(f, "block {}", h),
            Cursor::LedgerIndex(i) => write!(f, "ledger {}", i),
            Cursor::Signatures(s) => write!(f, "{} signature cursors", s.len()),
        }
    }
}

/// Where an interrupted newest-first history walk of one address continues
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumePoint {
    /// Oldest item already read; the walk continues strictly below it
    pub before: String,
    /// Top of the height window the interrupted walk started from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<u64>,
}

/// Persisted progress of one chain scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanCheckpoint {
    pub chain: Chain,
    pub cursor: Cursor,
    pub updated_at: u64,
    /// Unfinished history walks, by custody address
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resume: BTreeMap<String, ResumePoint>,
}

impl ScanCheckpoint {
    pub fn new(chain: Chain, cursor: Cursor, updated_at: u64) -> Self {
        Self {
            chain,
            cursor,
            updated_at,
            resume: BTreeMap::new(),
        }
    }

    pub fn with_resume(mut self, resume: BTreeMap<String, ResumePoint>) -> Self {
        self.resume = resume;
        self
    }

    /// Combine with the stored checkpoint without moving backwards.
    ///
    /// Numeric cursors keep the higher position. Signature cursors keep every
    /// stored address and take the newer signature where both have one.
    /// Resume points are those of the newer scan, which started from the
    /// stored ones.
    pub fn merged_with(self, previous: Option<&ScanCheckpoint>) -> ScanCheckpoint {
        let Some(previous) = previous else {
            return self;
        };

        let cursor = match (previous.cursor.clone(), self.cursor) {
            (Cursor::BlockHeight(old), Cursor::BlockHeight(new)) => Cursor::BlockHeight(old.max(new)),
            (Cursor::LedgerIndex(old), Cursor::LedgerIndex(new)) => Cursor::LedgerIndex(old.max(new)),
            (Cursor::Signatures(mut old), Cursor::Signatures(new)) => {
                old.extend(new);
                Cursor::Signatures(old)
            }
            (_, other) => other,
        };

        ScanCheckpoint {
            chain: self.chain,
            cursor,
            updated_at: self.updated_at.max(previous.updated_at),
            resume: self.resume,
        }
    }
}

/// Last observed scan outcome of a chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainScanStatus {
    pub last_scan_at: Option<u64>,
    pub last_success_at: Option<u64>,
    pub last_error: Option<String>,
    pub last_deposit_count: usize,
}
