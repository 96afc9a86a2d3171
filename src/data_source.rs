//! Data source descriptors used to enrich occurrence evidence.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::detector::DetectorId;
use crate::storage::StorageError;

/// A configured source of data packets for a detector.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: u64,
    /// e.g. `"snuba_query_subscription"`
    pub source_type: String,
    /// Matches `DataPacket::source_id`.
    pub source_id: String,
}

/// Resolves the data sources behind a packet. Treated as a black box.
pub trait DataSourceLookup: Send + Sync {
    /// Zero or more sources of `detector_id` whose id is `source_id`.
    fn find(&self, detector_id: DetectorId, source_id: &str)
        -> Result<Vec<DataSource>, StorageError>;
}

/// Thread-safe in-memory lookup.
#[derive(Debug, Default)]
pub struct InMemoryDataSourceLookup {
    sources: RwLock<HashMap<DetectorId, Vec<DataSource>>>,
}

impl InMemoryDataSourceLookup {
    /// Create a new empty lookup.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `source` to `detector_id`.
    pub fn register(&self, detector_id: DetectorId, source: DataSource) -> Result<(), StorageError> {
        let mut sources = self
            .sources
            .write()
            .map_err(|_| StorageError::BackendError("poisoned lock: data_source.register".to_string()))?;
        sources.entry(detector_id).or_default().push(source);
        Ok(())
    }
}

impl DataSourceLookup for InMemoryDataSourceLookup {
    fn find(
        &self,
        detector_id: DetectorId,
        source_id: &str,
    ) -> Result<Vec<DataSource>, StorageError> {
        let sources = self
            .sources
            .read()
            .map_err(|_| StorageError::BackendError("poisoned lock: data_source.find".to_string()))?;
        Ok(sources
            .get(&detector_id)
            .map(|list| {
                list.iter()
                    .filter(|s| s.source_id == source_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_filters_by_detector_and_source() {
        let lookup = InMemoryDataSourceLookup::new();
        let source = DataSource {
            id: 1,
            source_type: "subscription".to_string(),
            source_id: "sub-1".to_string(),
        };
        lookup.register(DetectorId(1), source.clone()).unwrap();
        lookup
            .register(
                DetectorId(1),
                DataSource {
                    id: 2,
                    source_type: "subscription".to_string(),
                    source_id: "sub-2".to_string(),
                },
            )
            .unwrap();

        assert_eq!(lookup.find(DetectorId(1), "sub-1").unwrap(), vec![source]);
        assert!(lookup.find(DetectorId(2), "sub-1").unwrap().is_empty());
    }
}
