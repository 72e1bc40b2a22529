//! Versioned Record Envelope
//!
//! Orphan deposits and ledger log entries are persisted as explicit tagged
//! variants inside an envelope carrying a schema version. Decoding is strict
//! and fails closed: a record that does not parse, has an unknown version, or
//! carries invalid values is rejected instead of being defaulted.

use serde::{Deserialize, Serialize};

use super::deposit::{OrphanDeposit, RecordError};
use super::encumbrance::LedgerLogEntry;

/// Current schema version of persisted records
pub const RECORD_SCHEMA_VERSION: u16 = 1;

/// A persisted record body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum LedgerRecord {
    OrphanDeposit(OrphanDeposit),
    LedgerLog(LedgerLogEntry),
}

impl LedgerRecord {
    fn kind(&self) -> &'static str {
        match self {
            LedgerRecord::OrphanDeposit(_) => "orphan_deposit",
            LedgerRecord::LedgerLog(_) => "ledger_log",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordEnvelope {
    pub schema_version: u16,
    pub record: LedgerRecord,
}

impl RecordEnvelope {
    pub fn new(record: LedgerRecord) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            record,
        }
    }

    pub fn encode(&self) -> Result<String, RecordError> {
        serde_json::to_string(self).map_err(|e| RecordError::Malformed(e.to_string()))
    }

    /// Parse and version-check an envelope
    pub fn decode(raw: &str) -> Result<Self, RecordError> {
        let envelope: RecordEnvelope =
            serde_json::from_str(raw).map_err(|e| RecordError::Malformed(e.to_string()))?;

        if envelope.schema_version != RECORD_SCHEMA_VERSION {
            return Err(RecordError::UnsupportedVersion(envelope.schema_version));
        }

        Ok(envelope)
    }
}

/// Encode an orphan for storage
pub fn encode_orphan(orphan: &OrphanDeposit) -> Result<String, RecordError> {
    RecordEnvelope::new(LedgerRecord::OrphanDeposit(orphan.clone())).encode()
}

/// Decode and validate a stored orphan
pub fn decode_orphan(raw: &str) -> Result<OrphanDeposit, RecordError> {
    match RecordEnvelope::decode(raw)?.record {
        LedgerRecord::OrphanDeposit(orphan) => {
            orphan.deposit.validate()?;
            Ok(orphan)
        }
        other => Err(RecordError::UnexpectedKind {
            expected: "orphan_deposit",
            got: other.kind().to_string(),
        }),
    }
}

/// Encode a ledger log entry for storage
pub fn encode_ledger_log(entry: &LedgerLogEntry) -> Result<String, RecordError> {
    RecordEnvelope::new(LedgerRecord::LedgerLog(entry.clone())).encode()
}

/// Decode and validate a stored ledger log entry
pub fn decode_ledger_log(raw: &str) -> Result<LedgerLogEntry, RecordError> {
    match RecordEnvelope::decode(raw)?.record {
        LedgerRecord::LedgerLog(entry) => {
            if entry.metal.trim().is_empty() {
                return Err(RecordError::MissingField("metal"));
            }
            Ok(entry)
        }
        other => Err(RecordError::UnexpectedKind {
            expected: "ledger_log",
            got: other.kind().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::chain::{Chain, Coin};
    use crate::types::deposit::Deposit;
    use crate::types::encumbrance::LedgerEvent;

    fn orphan() -> OrphanDeposit {
        OrphanDeposit::new(
            Deposit::new(Chain::Btc, Coin::Btc, "ab12", "bc1qsender", "bc1qcustody", 0.1, 10),
            "sender not mapped",
            20,
        )
    }

    #[test]
    fn test_orphan_envelope() {
        let raw = encode_orphan(&orphan()).unwrap();
        assert!(raw.contains("\"schema_version\":1"));
        assert!(raw.contains("\"kind\":\"orphan_deposit\""));
        assert_eq!(decode_orphan(&raw).unwrap(), orphan());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let raw = encode_orphan(&orphan())
            .unwrap()
            .replace("\"schema_version\":1", "\"schema_version\":7");
        assert_eq!(decode_orphan(&raw), Err(RecordError::UnsupportedVersion(7)));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let raw = encode_orphan(&orphan())
            .unwrap()
            .replace("\"reason\":", "\"extra\":1,\"reason\":");
        assert!(matches!(decode_orphan(&raw), Err(RecordError::Malformed(_))));
    }

    #[test]
    fn test_rejects_bare_deposit_kind() {
        let raw = encode_orphan(&orphan())
            .unwrap()
            .replace("\"kind\":\"orphan_deposit\"", "\"kind\":\"deposit\"");
        assert!(matches!(decode_orphan(&raw), Err(RecordError::Malformed(_))));
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let entry = LedgerLogEntry {
            metal: "AUXG".to_string(),
            event: LedgerEvent::AllocationAdjusted { delta_oz: 1.0 },
            recorded_at: 5,
        };
        let raw = encode_ledger_log(&entry).unwrap();
        assert!(matches!(
            decode_orphan(&raw),
            Err(RecordError::UnexpectedKind { .. })
        ));
        assert_eq!(decode_ledger_log(&raw).unwrap(), entry);
    }

    #[test]
    fn test_rejects_invalid_amount() {
        let raw = encode_orphan(&orphan())
            .unwrap()
            .replace("\"amount\":0.1", "\"amount\":-3.0");
        assert!(matches!(decode_orphan(&raw), Err(RecordError::InvalidAmount(_))));
    }

    #[test]
    fn test_rejects_empty_blob() {
        assert!(decode_orphan("{}").is_err());
        assert!(decode_orphan("").is_err());
    }
}
