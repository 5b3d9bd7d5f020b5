//! Tablet server request handling
//!
//! Application failures travel in the response's `error` field, and
//! per-row failures of a write in `per_row_errors`. An `Err` return means
//! the request itself was malformed.

use super::manager::TabletManager;
use super::protocol::*;
use super::scanners::{Scanner, ScannerManager};
use crate::encoding::EncodedKey;
use crate::row::Row;
use crate::rowchange::{split_mutations, RowChangeListDecoder};
use crate::schema::Schema;
use crate::types::Value;
use crate::wal::RowOperation;
use crate::{Result, TabletError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Operations of a tablet server
pub trait TabletServerService: Send + Sync {
    fn ping(&self) -> PingResponse;

    fn write(&self, req: WriteRequest) -> Result<WriteResponse>;

    fn scan(&self, req: ScanRequest) -> Result<ScanResponse>;

    fn close_scanner(&self, scanner_id: &str) -> CloseScannerResponse;

    fn alter_schema(&self, req: AlterSchemaRequest) -> Result<AlterSchemaResponse>;

    fn create_tablet(&self, req: CreateTabletRequest) -> Result<CreateTabletResponse>;

    fn delete_tablet(&self, req: DeleteTabletRequest) -> Result<DeleteTabletResponse>;

    fn change_config(&self, req: ChangeConfigRequest) -> Result<ChangeConfigResponse>;
}

/// Row operations decoded from a write request
#[derive(Default)]
struct DecodedWrite {
    ops: Vec<RowOperation>,
    /// Request row index of each entry in `ops`
    indices: Vec<usize>,
    errors: Vec<PerRowError>,
}

impl DecodedWrite {
    fn accept(&mut self, row_index: usize, op: RowOperation) {
        self.ops.push(op);
        self.indices.push(row_index);
    }

    fn reject(&mut self, row_index: usize, err: &TabletError) {
        self.errors.push(PerRowError {
            row_index,
            error: err.into(),
        });
    }
}

pub struct TabletServiceImpl {
    manager: Arc<TabletManager>,
    scanners: Arc<ScannerManager>,
}

impl TabletServiceImpl {
    pub fn new(manager: Arc<TabletManager>, scanners: Arc<ScannerManager>) -> Self {
        Self { manager, scanners }
    }

    pub fn manager(&self) -> &Arc<TabletManager> {
        &self.manager
    }

    pub fn scanners(&self) -> &Arc<ScannerManager> {
        &self.scanners
    }

    /// Turn client rows and mutations into tablet operations
    ///
    /// Errors that concern the whole request are returned; errors of a
    /// single row are collected.
    fn decode_write(schema: &Schema, req: WriteRequest) -> Result<DecodedWrite> {
        schema.validate_client_schema(&req.schema, !req.insert_rows.is_empty())?;

        let mut decoded = DecodedWrite::default();
        let num_inserts = req.insert_rows.len();
        for (idx, values) in req.insert_rows.into_iter().enumerate() {
            match Row::from_client(schema, &req.schema, values) {
                Ok(row) => decoded.accept(idx, RowOperation::Insert { row }),
                Err(e) => decoded.reject(idx, &e),
            }
        }

        let (key_schema, keys) = match req.mutate_row_keys {
            Some(block) => {
                schema.validate_client_schema(&block.schema, false)?;
                (block.schema, block.keys)
            }
            None => (Schema::empty(), Vec::new()),
        };
        let changes = split_mutations(&req.encoded_mutations)?;
        if keys.len() != changes.len() {
            return Err(TabletError::InvalidMutation(format!(
                "Mismatched number of row keys ({}) and mutations ({})",
                keys.len(),
                changes.len()
            )));
        }
        if keys.is_empty() {
            return Ok(decoded);
        }

        let key_positions = Self::key_positions(schema, &key_schema)?;
        for (i, (key_values, data)) in keys.into_iter().zip(changes).enumerate() {
            let idx = num_inserts + i;
            match Self::decode_mutation(schema, &key_schema, &key_positions, &key_values, data) {
                Ok(op) => decoded.accept(idx, op),
                Err(e) => decoded.reject(idx, &e),
            }
        }
        Ok(decoded)
    }

    /// Position of each tablet key column among the client's key values
    fn key_positions(schema: &Schema, key_schema: &Schema) -> Result<Vec<usize>> {
        (0..schema.num_key_columns())
            .map(|k| {
                let col = schema.column(k);
                key_schema
                    .find_column(&col.name)
                    .filter(|&pos| pos < key_schema.num_key_columns())
                    .ok_or_else(|| {
                        TabletError::MismatchedSchema(format!("Client missing required column: {}", col))
                    })
            })
            .collect()
    }

    fn decode_mutation(
        schema: &Schema,
        key_schema: &Schema,
        key_positions: &[usize],
        key_values: &[Value],
        data: &[u8],
    ) -> Result<RowOperation> {
        if key_values.len() != key_schema.num_key_columns() {
            return Err(TabletError::InvalidArgument(format!(
                "row key has {} values but client schema has {} key columns",
                key_values.len(),
                key_schema.num_key_columns()
            )));
        }
        let ordered: Vec<&Value> = key_positions.iter().map(|&pos| &key_values[pos]).collect();
        let key = EncodedKey::encode(schema, &ordered)?;
        let change = RowChangeListDecoder::decode_client(key_schema, schema, data)?;
        Ok(RowOperation::Mutate { key, change })
    }

    fn start_scan(&self, req: NewScanRequest, batch_size_bytes: usize) -> ScanResponse {
        let iter = self
            .manager
            .get(&req.tablet_id)
            .and_then(|tablet| tablet.new_row_iterator(&req.projected_columns, &req.range_predicates));
        let scanner = match iter {
            Ok(iter) => Arc::new(Scanner::new(&req.tablet_id, iter)),
            Err(e) => return scan_failed(e),
        };

        match scanner.next_batch(batch_size_bytes) {
            Ok((rows, has_more)) => {
                let scanner_id = if has_more {
                    self.scanners.register(scanner.clone());
                    Some(scanner.id().to_string())
                } else {
                    None
                };
                ScanResponse {
                    error: None,
                    rows,
                    has_more_results: has_more,
                    scanner_id,
                }
            }
            Err(e) => scan_failed(e),
        }
    }

    fn continue_scan(&self, scanner_id: &str, batch_size_bytes: usize) -> ScanResponse {
        let scanner = match self.scanners.lookup(scanner_id) {
            Some(scanner) => scanner,
            None => return scan_failed(TabletError::ScannerExpired(scanner_id.to_string())),
        };

        match scanner.next_batch(batch_size_bytes) {
            Ok((rows, has_more)) => {
                if !has_more {
                    self.scanners.unregister(scanner_id);
                }
                ScanResponse {
                    error: None,
                    rows,
                    has_more_results: has_more,
                    scanner_id: has_more.then(|| scanner_id.to_string()),
                }
            }
            Err(e) => {
                self.scanners.unregister(scanner_id);
                scan_failed(e)
            }
        }
    }
}

fn app_error(err: TabletError) -> Option<TabletServerError> {
    debug!("Request failed: {}", err);
    Some(err.into())
}

fn scan_failed(err: TabletError) -> ScanResponse {
    ScanResponse {
        error: app_error(err),
        ..Default::default()
    }
}

impl TabletServerService for TabletServiceImpl {
    fn ping(&self) -> PingResponse {
        PingResponse {}
    }

    fn write(&self, req: WriteRequest) -> Result<WriteResponse> {
        let tablet = match self.manager.get(&req.tablet_id) {
            Ok(tablet) => tablet,
            Err(e) => {
                return Ok(WriteResponse {
                    error: app_error(e),
                    ..Default::default()
                })
            }
        };

        let decoded = match Self::decode_write(&tablet.schema(), req) {
            Ok(decoded) => decoded,
            Err(e) => {
                return Ok(WriteResponse {
                    error: app_error(e),
                    ..Default::default()
                })
            }
        };

        let mut response = WriteResponse::default();
        let mut per_row_errors = decoded.errors;
        if !decoded.ops.is_empty() {
            match tablet.write(decoded.ops) {
                Ok(result) => {
                    response.timestamp = result.timestamp;
                    per_row_errors.extend(result.failed_ops.into_iter().map(|(i, e)| PerRowError {
                        row_index: decoded.indices[i],
                        error: e.into(),
                    }));
                }
                Err(e) => {
                    warn!("Write to tablet {} failed: {}", tablet.tablet_id(), e);
                    response.error = app_error(e);
                    return Ok(response);
                }
            }
        }
        per_row_errors.sort_by_key(|e| e.row_index);
        response.per_row_errors = per_row_errors;
        Ok(response)
    }

    fn scan(&self, req: ScanRequest) -> Result<ScanResponse> {
        match (req.scanner_id, req.new_scan_request) {
            (Some(_), Some(_)) => Err(TabletError::InvalidArgument(
                "Must not pass both a scanner_id and new_scan_request".into(),
            )),
            (None, None) => Err(TabletError::InvalidArgument(
                "Must pass either a scanner_id or new_scan_request".into(),
            )),
            (None, Some(new_scan)) => Ok(self.start_scan(new_scan, req.batch_size_bytes)),
            (Some(id), None) => Ok(self.continue_scan(&id, req.batch_size_bytes)),
        }
    }

    fn close_scanner(&self, scanner_id: &str) -> CloseScannerResponse {
        if self.scanners.unregister(scanner_id) {
            return CloseScannerResponse::default();
        }
        CloseScannerResponse {
            error: app_error(TabletError::ScannerExpired(scanner_id.to_string())),
        }
    }

    fn alter_schema(&self, req: AlterSchemaRequest) -> Result<AlterSchemaResponse> {
        let altered = self.manager.get(&req.tablet_id).and_then(|tablet| {
            let current = tablet.schema();
            if req.schema_version != current.version() + 1 {
                return Err(TabletError::InvalidSchema(format!(
                    "Expected schema version {}, got {}",
                    current.version() + 1,
                    req.schema_version
                )));
            }
            let new_schema = current.alter(&req.schema)?;
            tablet.alter_schema(new_schema)
        });
        Ok(AlterSchemaResponse {
            error: altered.err().and_then(app_error),
        })
    }

    fn create_tablet(&self, req: CreateTabletRequest) -> Result<CreateTabletResponse> {
        debug!(
            "Creating tablet {} of table {} ({}) for key range {:?}..{:?}",
            req.tablet_id, req.table_name, req.table_id, req.start_key, req.end_key
        );
        let created = self
            .manager
            .create_tablet(&req.tablet_id, &req.table_name, req.schema, req.quorum);
        Ok(CreateTabletResponse {
            error: created.err().and_then(app_error),
        })
    }

    fn delete_tablet(&self, req: DeleteTabletRequest) -> Result<DeleteTabletResponse> {
        let deleted = self.manager.delete_tablet(&req.tablet_id);
        if deleted.is_ok() {
            let closed = self.scanners.remove_for_tablet(&req.tablet_id);
            if closed > 0 {
                info!("Closed {} scanners of deleted tablet {}", closed, req.tablet_id);
            }
        }
        Ok(DeleteTabletResponse {
            error: deleted.err().and_then(app_error),
        })
    }

    fn change_config(&self, req: ChangeConfigRequest) -> Result<ChangeConfigResponse> {
        let changed = self
            .manager
            .get(&req.tablet_id)
            .and_then(|tablet| tablet.change_config(req.new_config));
        Ok(ChangeConfigResponse {
            error: changed.err().and_then(app_error),
        })
    }
}
