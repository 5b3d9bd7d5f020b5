//! Tablets hosted by one server

use crate::schema::Schema;
use crate::tablet::{QuorumConfig, Tablet, TabletConfig, TabletMetadata};
use crate::{Result, TabletError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const TABLETS_DIR: &str = "tablets";
const SERVER_UUID_FILE: &str = "server-uuid";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletManagerConfig {
    /// Root of all server data
    pub data_dir: PathBuf,
    pub tablet: TabletConfig,
    /// Idle time after which a scanner is dropped
    pub scanner_ttl: Duration,
    /// Period of the background maintenance pass
    pub maintenance_interval: Duration,
}

impl Default for TabletManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            tablet: TabletConfig::default(),
            scanner_ttl: crate::config::SCANNER_TTL,
            maintenance_interval: crate::config::MAINTENANCE_INTERVAL,
        }
    }
}

/// Opens, creates and deletes the tablets under `<data_dir>/tablets`
pub struct TabletManager {
    config: TabletManagerConfig,
    server_uuid: String,
    tablets: RwLock<HashMap<String, Arc<Tablet>>>,
}

impl TabletManager {
    /// Bootstrap every tablet found on disk
    ///
    /// A tablet that fails to bootstrap fails the whole open.
    pub fn open(config: TabletManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(config.data_dir.join(TABLETS_DIR))?;
        let server_uuid = Self::load_or_create_uuid(&config.data_dir)?;

        let manager = Self {
            config,
            server_uuid,
            tablets: RwLock::new(HashMap::new()),
        };
        manager.load_tablets()?;
        info!(
            "Tablet server {} opened with {} tablets",
            manager.server_uuid,
            manager.tablets.read().len()
        );
        Ok(manager)
    }

    pub fn config(&self) -> &TabletManagerConfig {
        &self.config
    }

    pub fn server_uuid(&self) -> &str {
        &self.server_uuid
    }

    /// Create and open a new tablet
    ///
    /// Without an explicit quorum the tablet gets a local config naming this
    /// server as its only peer.
    pub fn create_tablet(
        &self,
        tablet_id: &str,
        table_name: &str,
        schema: Schema,
        quorum: Option<QuorumConfig>,
    ) -> Result<Arc<Tablet>> {
        Self::validate_tablet_id(tablet_id)?;
        let mut tablets = self.tablets.write();
        let dir = self.tablet_dir(tablet_id);
        if tablets.contains_key(tablet_id) || TabletMetadata::exists(&dir) {
            return Err(TabletError::TabletAlreadyExists(tablet_id.to_string()));
        }

        let quorum = quorum.unwrap_or_else(|| QuorumConfig::initial(&self.server_uuid));
        let tablet = Tablet::create(&dir, tablet_id, table_name, schema, quorum, self.config.tablet.clone())?;
        tablets.insert(tablet_id.to_string(), tablet.clone());
        info!("Created tablet {} for table {}", tablet_id, table_name);
        Ok(tablet)
    }

    /// Close a tablet and remove its data
    pub fn delete_tablet(&self, tablet_id: &str) -> Result<()> {
        let mut tablets = self.tablets.write();
        let tablet = tablets
            .remove(tablet_id)
            .ok_or_else(|| TabletError::TabletNotFound(tablet_id.to_string()))?;

        // Wait out a running flush or compaction
        let _compaction = tablet.compaction_lock.lock();
        let dir = tablet.dir().to_path_buf();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        info!("Deleted tablet {}", tablet_id);
        Ok(())
    }

    pub fn lookup(&self, tablet_id: &str) -> Option<Arc<Tablet>> {
        self.tablets.read().get(tablet_id).cloned()
    }

    /// Like [`lookup`](Self::lookup), failing with `TabletNotFound`
    pub fn get(&self, tablet_id: &str) -> Result<Arc<Tablet>> {
        self.lookup(tablet_id)
            .ok_or_else(|| TabletError::TabletNotFound(tablet_id.to_string()))
    }

    pub fn list_tablets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tablets.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn tablets(&self) -> Vec<Arc<Tablet>> {
        self.tablets.read().values().cloned().collect()
    }

    /// Flush every tablet and release them
    pub fn shutdown(&self) -> Result<()> {
        let tablets: Vec<Arc<Tablet>> = self.tablets.write().drain().map(|(_, t)| t).collect();
        for tablet in &tablets {
            tablet.flush()?;
        }
        info!("Tablet server {} shut down {} tablets", self.server_uuid, tablets.len());
        Ok(())
    }

    fn tablet_dir(&self, tablet_id: &str) -> PathBuf {
        self.config.data_dir.join(TABLETS_DIR).join(tablet_id)
    }

    fn load_tablets(&self) -> Result<()> {
        let root = self.config.data_dir.join(TABLETS_DIR);
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            if !TabletMetadata::exists(&dir) {
                warn!("Ignoring {:?}: no tablet metadata", dir);
                continue;
            }
            let tablet = Tablet::open(&dir, self.config.tablet.clone())?;
            self.tablets.write().insert(tablet.tablet_id().to_string(), tablet);
        }
        Ok(())
    }

    fn load_or_create_uuid(data_dir: &std::path::Path) -> Result<String> {
        let path = data_dir.join(SERVER_UUID_FILE);
        if path.exists() {
            return Ok(std::fs::read_to_string(&path)?.trim().to_string());
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        std::fs::write(&path, &uuid)?;
        Ok(uuid)
    }

    /// Tablet ids name directories, so keep them to a safe alphabet
    fn validate_tablet_id(tablet_id: &str) -> Result<()> {
        let valid = !tablet_id.is_empty()
            && tablet_id.len() <= 128
            && tablet_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(TabletError::InvalidArgument(format!(
                "invalid tablet id: {:?}",
                tablet_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;
    use crate::schema::ColumnSchema;
    use crate::types::{DataType, Value};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> TabletManagerConfig {
        TabletManagerConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new("key", DataType::UInt32),
                ColumnSchema::new("val", DataType::String),
            ],
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_create_reopen_delete() {
        let dir = TempDir::new().unwrap();
        let uuid = {
            let manager = TabletManager::open(config(&dir)).unwrap();
            let tablet = manager.create_tablet("t1", "table", schema(), None).unwrap();
            let row = Row::from_values(&tablet.schema(), vec![Value::UInt32(1), Value::from("a")]).unwrap();
            tablet.insert(row).unwrap();
            manager.create_tablet("t2", "table", schema(), None).unwrap();
            assert_eq!(manager.list_tablets(), vec!["t1", "t2"]);
            manager.server_uuid().to_string()
        };

        let manager = TabletManager::open(config(&dir)).unwrap();
        assert_eq!(manager.server_uuid(), uuid);
        assert_eq!(manager.list_tablets(), vec!["t1", "t2"]);
        assert_eq!(manager.get("t1").unwrap().count_rows().unwrap(), 1);

        manager.delete_tablet("t1").unwrap();
        assert!(manager.lookup("t1").is_none());
        assert!(!dir.path().join(TABLETS_DIR).join("t1").exists());
        assert!(matches!(manager.delete_tablet("t1"), Err(TabletError::TabletNotFound(_))));
    }

    #[test]
    fn test_create_existing_tablet_fails() {
        let dir = TempDir::new().unwrap();
        let manager = TabletManager::open(config(&dir)).unwrap();
        manager.create_tablet("t1", "table", schema(), None).unwrap();
        assert!(matches!(
            manager.create_tablet("t1", "table", schema(), None),
            Err(TabletError::TabletAlreadyExists(_))
        ));
    }

    #[test]
    fn test_invalid_tablet_ids() {
        let dir = TempDir::new().unwrap();
        let manager = TabletManager::open(config(&dir)).unwrap();
        for id in ["", "../escape", "a/b", "with space"] {
            assert!(matches!(
                manager.create_tablet(id, "table", schema(), None),
                Err(TabletError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_default_quorum_names_server() {
        let dir = TempDir::new().unwrap();
        let manager = TabletManager::open(config(&dir)).unwrap();
        let tablet = manager.create_tablet("t1", "table", schema(), None).unwrap();
        let quorum = tablet.consensus().committed_config();
        assert_eq!(quorum.seqno, 0);
        assert_eq!(quorum.peers[0].permanent_uuid, manager.server_uuid());
    }
}
