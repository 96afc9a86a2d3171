//! Data packets fed into detectors.

use serde::{Deserialize, Serialize};

/// Sub-partition of one packet's evaluation. `None` means "no partitioning".
pub type GroupKey = Option<String>;

/// One arriving unit of evaluation input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    /// Correlates the packet with the detector's configured data source.
    pub source_id: String,
    /// Strictly increasing per detector and source; used for dedupe.
    pub sequence: u64,
    /// Detector-specific payload.
    pub payload: serde_json::Value,
}

impl DataPacket {
    /// Creates a new packet.
    #[must_use]
    pub fn new(source_id: impl Into<String>, sequence: u64, payload: serde_json::Value) -> Self {
        Self {
            source_id: source_id.into(),
            sequence,
            payload,
        }
    }
}
