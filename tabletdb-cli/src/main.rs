//! TabletDB CLI
//!
//! Drives the tablets under a data directory directly, without a server.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabletdb_core::compaction::CompactionPolicy;
use tabletdb_core::schema::{ColumnSchema, Schema};
use tabletdb_core::tablet::ColumnRangePredicate;
use tabletdb_core::tserver::{
    CreateTabletRequest, MaintenanceManager, NewScanRequest, ScanRequest, ScannerManager, TabletManager,
    TabletManagerConfig, TabletServerService, TabletServiceImpl, WriteRequest,
};
use tabletdb_core::types::{DataType, Value};
use tabletdb_core::wal::WalReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tabletdb")]
#[command(about = "Inspect and drive TabletDB tablets", version = tabletdb_core::VERSION)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a tablet
    Create {
        tablet_id: String,

        /// Columns as name:type, with a trailing '?' for nullable (key:uint32,name:string?)
        #[arg(short, long)]
        schema: String,

        /// Number of leading key columns
        #[arg(short, long, default_value_t = 1)]
        keys: usize,

        #[arg(short, long, default_value = "default")]
        table: String,
    },

    /// Delete a tablet and its data
    Delete { tablet_id: String },

    /// List tablets
    List,

    /// Insert rows given as comma separated values in schema order
    Insert {
        tablet_id: String,
        rows: Vec<String>,
    },

    /// Print the rows of a tablet in key order
    Scan {
        tablet_id: String,

        /// Restrict a column to an inclusive range: column:lower:upper (either bound may be empty)
        #[arg(short, long)]
        range: Vec<String>,

        #[arg(short, long, default_value_t = 1024 * 1024)]
        batch_size: usize,
    },

    /// Flush the MemRowSet to a new DiskRowSet
    Flush { tablet_id: String },

    /// Merge all DiskRowSets into one
    Compact { tablet_id: String },

    /// Print tablet statistics as JSON
    Stats { tablet_id: String },

    /// Print the write-ahead log of a tablet without opening it
    DumpWal { tablet_id: String },

    /// Run background maintenance for a while
    Maintain {
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    if let Commands::DumpWal { tablet_id } = &args.command {
        return dump_wal(&args.data_dir, tablet_id);
    }

    let manager = Arc::new(TabletManager::open(TabletManagerConfig {
        data_dir: args.data_dir.clone(),
        ..Default::default()
    })?);
    let scanners = Arc::new(ScannerManager::new());
    let service = TabletServiceImpl::new(manager.clone(), scanners.clone());

    match args.command {
        Commands::Create {
            tablet_id,
            schema,
            keys,
            table,
        } => {
            let schema = parse_schema(&schema, keys)?;
            let resp = service.create_tablet(CreateTabletRequest {
                table_id: table.clone(),
                tablet_id: tablet_id.clone(),
                table_name: table,
                start_key: Vec::new(),
                end_key: Vec::new(),
                schema,
                quorum: None,
            })?;
            if let Some(error) = resp.error {
                bail!("{:?}: {}", error.code, error.message);
            }
            println!("Created tablet {}", tablet_id);
        }
        Commands::Delete { tablet_id } => {
            manager.delete_tablet(&tablet_id)?;
            println!("Deleted tablet {}", tablet_id);
        }
        Commands::List => {
            for tablet_id in manager.list_tablets() {
                println!("{}", tablet_id);
            }
        }
        Commands::Insert { tablet_id, rows } => {
            let schema = manager.get(&tablet_id)?.schema().without_ids();
            let mut req = WriteRequest::new(&tablet_id);
            req.insert_rows = rows
                .iter()
                .map(|row| parse_row(&schema, row))
                .collect::<Result<Vec<_>>>()?;
            req.schema = schema;

            let resp = service.write(req)?;
            if let Some(error) = resp.error {
                bail!("{:?}: {}", error.code, error.message);
            }
            for err in &resp.per_row_errors {
                eprintln!("row {}: {}", err.row_index, err.error.message);
            }
            println!("Inserted {} rows", rows.len() - resp.per_row_errors.len());
        }
        Commands::Scan {
            tablet_id,
            range,
            batch_size,
        } => {
            let schema = manager.get(&tablet_id)?.schema().without_ids();
            let predicates = range
                .iter()
                .map(|r| parse_range(&schema, r))
                .collect::<Result<Vec<_>>>()?;
            scan(&service, &tablet_id, schema, predicates, batch_size)?;
        }
        Commands::Flush { tablet_id } => {
            manager.get(&tablet_id)?.flush()?;
            println!("Flushed tablet {}", tablet_id);
        }
        Commands::Compact { tablet_id } => {
            manager.get(&tablet_id)?.compact(CompactionPolicy::ForceCompactAll)?;
            println!("Compacted tablet {}", tablet_id);
        }
        Commands::Stats { tablet_id } => {
            let stats = manager.get(&tablet_id)?.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Maintain { seconds } => {
            let maintenance = MaintenanceManager::start(manager.clone(), scanners);
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            maintenance.shutdown().await?;
            info!("Maintenance stopped after {}s", seconds);
        }
        Commands::DumpWal { tablet_id } => dump_wal(&args.data_dir, &tablet_id)?,
    }

    manager.shutdown()?;
    Ok(())
}

fn scan(
    service: &TabletServiceImpl,
    tablet_id: &str,
    schema: Schema,
    predicates: Vec<ColumnRangePredicate>,
    batch_size: usize,
) -> Result<()> {
    let mut req = ScanRequest::new_scan(
        NewScanRequest {
            tablet_id: tablet_id.to_string(),
            projected_columns: schema.clone(),
            range_predicates: predicates,
        },
        batch_size,
    );
    let mut count = 0;
    loop {
        let resp = service.scan(req)?;
        if let Some(error) = resp.error {
            bail!("{:?}: {}", error.code, error.message);
        }
        for row in &resp.rows {
            println!("{}", schema.debug_row(row));
        }
        count += resp.rows.len();
        match resp.scanner_id {
            Some(id) if resp.has_more_results => req = ScanRequest::continue_scan(id, batch_size),
            _ => break,
        }
    }
    eprintln!("{} rows", count);
    Ok(())
}

fn dump_wal(data_dir: &std::path::Path, tablet_id: &str) -> Result<()> {
    let tablet_dir = data_dir.join("tablets").join(tablet_id);
    let mut entries = Vec::new();
    for wal_dir in ["wal-recovery", "wal"] {
        let dir = tablet_dir.join(wal_dir);
        if dir.exists() {
            entries = WalReader::new(&dir)
                .read_all()
                .with_context(|| format!("reading {:?}", dir))?;
            break;
        }
    }
    for entry in &entries {
        println!("{} {:?}", entry.timestamp, entry.op);
    }
    eprintln!("{} entries", entries.len());
    Ok(())
}

fn parse_data_type(name: &str) -> Result<DataType> {
    Ok(match name {
        "bool" => DataType::Bool,
        "int8" => DataType::Int8,
        "int16" => DataType::Int16,
        "int32" => DataType::Int32,
        "int64" => DataType::Int64,
        "uint8" => DataType::UInt8,
        "uint16" => DataType::UInt16,
        "uint32" => DataType::UInt32,
        "uint64" => DataType::UInt64,
        "float" => DataType::Float,
        "double" => DataType::Double,
        "string" => DataType::String,
        "binary" => DataType::Binary,
        other => bail!("unknown type {}", other),
    })
}

fn parse_schema(text: &str, keys: usize) -> Result<Schema> {
    let columns = text
        .split(',')
        .map(|col| {
            let (name, ty) = col
                .split_once(':')
                .ok_or_else(|| anyhow!("column {:?} is not name:type", col))?;
            let (ty, nullable) = match ty.strip_suffix('?') {
                Some(ty) => (ty, true),
                None => (ty, false),
            };
            let column = ColumnSchema::new(name.trim(), parse_data_type(ty.trim())?);
            Ok(if nullable { column.nullable() } else { column })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Schema::new(columns, keys)?)
}

fn parse_value(column: &ColumnSchema, text: &str) -> Result<Value> {
    if text.is_empty() && column.nullable {
        return Ok(Value::Null);
    }
    let parse_err = || anyhow!("bad value {:?} for column {}", text, column);
    Ok(match column.data_type {
        DataType::Bool => Value::Bool(text.parse().map_err(|_| parse_err())?),
        DataType::Int8 => Value::Int8(text.parse().map_err(|_| parse_err())?),
        DataType::Int16 => Value::Int16(text.parse().map_err(|_| parse_err())?),
        DataType::Int32 => Value::Int32(text.parse().map_err(|_| parse_err())?),
        DataType::Int64 => Value::Int64(text.parse().map_err(|_| parse_err())?),
        DataType::UInt8 => Value::UInt8(text.parse().map_err(|_| parse_err())?),
        DataType::UInt16 => Value::UInt16(text.parse().map_err(|_| parse_err())?),
        DataType::UInt32 => Value::UInt32(text.parse().map_err(|_| parse_err())?),
        DataType::UInt64 => Value::UInt64(text.parse().map_err(|_| parse_err())?),
        DataType::Float => Value::Float(text.parse().map_err(|_| parse_err())?),
        DataType::Double => Value::Double(text.parse().map_err(|_| parse_err())?),
        DataType::String => Value::String(text.to_string()),
        DataType::Binary => Value::Binary(text.as_bytes().to_vec()),
    })
}

fn parse_row(schema: &Schema, row: &str) -> Result<Vec<Value>> {
    let fields: Vec<&str> = row.split(',').collect();
    if fields.len() != schema.num_columns() {
        bail!("row {:?} has {} fields, expected {}", row, fields.len(), schema.num_columns());
    }
    schema
        .columns()
        .iter()
        .zip(fields)
        .map(|(col, text)| parse_value(col, text))
        .collect()
}

fn parse_range(schema: &Schema, text: &str) -> Result<ColumnRangePredicate> {
    let mut parts = text.splitn(3, ':');
    let (name, lower, upper) = match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(lower), Some(upper)) => (name, lower, upper),
        _ => bail!("range {:?} is not column:lower:upper", text),
    };
    let idx = schema
        .find_column(name)
        .ok_or_else(|| anyhow!("unknown column {}", name))?;
    let column = schema.column(idx);
    let bound = |text: &str| -> Result<Option<Value>> {
        if text.is_empty() {
            Ok(None)
        } else {
            parse_value(column, text).map(Some)
        }
    };
    Ok(ColumnRangePredicate::new(name, bound(lower)?, bound(upper)?))
}
