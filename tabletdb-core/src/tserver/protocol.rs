//! Request and response types of the tablet server

use crate::mvcc::Timestamp;
use crate::schema::Schema;
use crate::tablet::{ColumnRangePredicate, QuorumConfig};
use crate::types::Value;
use crate::{TabletError, TabletServerErrorCode};
use serde::{Deserialize, Serialize};

/// Application error carried in a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletServerError {
    pub code: TabletServerErrorCode,
    pub message: String,
}

impl From<&TabletError> for TabletServerError {
    fn from(err: &TabletError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<TabletError> for TabletServerError {
    fn from(err: TabletError) -> Self {
        Self::from(&err)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {}

/// Row keys for a mutation batch
///
/// `schema` is the client's view of the table; each entry of `keys` holds
/// the values of its key columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowKeyBlock {
    pub schema: Schema,
    pub keys: Vec<Vec<Value>>,
}

/// Inserts and mutations for one tablet
///
/// Row indices in the response count inserts first, then mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub tablet_id: String,
    /// Layout of `insert_rows`
    pub schema: Schema,
    pub insert_rows: Vec<Vec<Value>>,
    pub mutate_row_keys: Option<RowKeyBlock>,
    /// Length-framed row change lists, one per mutated key
    pub encoded_mutations: Vec<u8>,
}

impl WriteRequest {
    pub fn new(tablet_id: impl Into<String>) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            schema: Schema::empty(),
            insert_rows: Vec::new(),
            mutate_row_keys: None,
            encoded_mutations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerRowError {
    pub row_index: usize,
    pub error: TabletServerError,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub error: Option<TabletServerError>,
    pub per_row_errors: Vec<PerRowError>,
    /// Commit timestamp, when anything was applied
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewScanRequest {
    pub tablet_id: String,
    pub projected_columns: Schema,
    pub range_predicates: Vec<ColumnRangePredicate>,
}

/// Opens a scan or continues one; exactly one of the two must be set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scanner_id: Option<String>,
    pub new_scan_request: Option<NewScanRequest>,
    pub batch_size_bytes: usize,
}

impl ScanRequest {
    pub fn new_scan(request: NewScanRequest, batch_size_bytes: usize) -> Self {
        Self {
            new_scan_request: Some(request),
            batch_size_bytes,
            ..Default::default()
        }
    }

    pub fn continue_scan(scanner_id: impl Into<String>, batch_size_bytes: usize) -> Self {
        Self {
            scanner_id: Some(scanner_id.into()),
            batch_size_bytes,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub error: Option<TabletServerError>,
    /// Rows in the projection's column order
    pub rows: Vec<Vec<Value>>,
    pub has_more_results: bool,
    /// Set while more results remain
    pub scanner_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseScannerResponse {
    pub error: Option<TabletServerError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterSchemaRequest {
    pub tablet_id: String,
    /// Requested client schema, without column ids
    pub schema: Schema,
    /// Must be the current version plus one
    pub schema_version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlterSchemaResponse {
    pub error: Option<TabletServerError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTabletRequest {
    pub table_id: String,
    pub tablet_id: String,
    pub table_name: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub schema: Schema,
    /// Local single-replica config when absent
    pub quorum: Option<QuorumConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateTabletResponse {
    pub error: Option<TabletServerError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteTabletRequest {
    pub tablet_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteTabletResponse {
    pub error: Option<TabletServerError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigRequest {
    pub tablet_id: String,
    pub new_config: QuorumConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeConfigResponse {
    pub error: Option<TabletServerError>,
}
