//! Background flushes, compactions and scanner expiry

use super::manager::TabletManager;
use super::scanners::ScannerManager;
use crate::{Result, TabletError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodic maintenance of every tablet of a [`TabletManager`]
pub struct MaintenanceManager {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MaintenanceManager {
    /// Spawn the maintenance loop on the current tokio runtime
    ///
    /// Period and scanner idle timeout come from the manager's config.
    pub fn start(manager: Arc<TabletManager>, scanners: Arc<ScannerManager>) -> Self {
        let interval = manager.config().maintenance_interval;
        let scanner_ttl = manager.config().scanner_ttl;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            info!("Maintenance running every {:?}", interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_pass(&manager, &scanners, scanner_ttl).await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Maintenance shutting down");
                        break;
                    }
                }
            }
        });

        Self { shutdown_tx, handle }
    }

    /// One maintenance pass; returns the number of tablets that did work
    ///
    /// Failures are logged and left for the next pass.
    pub async fn run_pass(manager: &Arc<TabletManager>, scanners: &ScannerManager, scanner_ttl: Duration) -> usize {
        let mut busy = 0;
        for tablet in manager.tablets() {
            let tablet_id = tablet.tablet_id().to_string();
            match tokio::task::spawn_blocking(move || tablet.run_maintenance()).await {
                Ok(Ok(report)) if report.did_work() => {
                    debug!("Maintenance on tablet {}: {:?}", tablet_id, report);
                    busy += 1;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Maintenance on tablet {} failed: {}", tablet_id, e),
                Err(e) => warn!("Maintenance task for tablet {} did not finish: {}", tablet_id, e),
            }
        }

        let expired = scanners.remove_expired(scanner_ttl);
        if expired > 0 {
            debug!("Expired {} idle scanners", expired);
        }
        busy
    }

    /// Stop the loop and wait for a running pass to finish
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(true).ok();
        self.handle
            .await
            .map_err(|e| TabletError::Internal(format!("maintenance task join error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;
    use crate::schema::{ColumnSchema, Schema};
    use crate::tablet::TabletConfig;
    use crate::tserver::manager::TabletManagerConfig;
    use crate::tserver::scanners::Scanner;
    use crate::types::{DataType, Value};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Arc<TabletManager> {
        let config = TabletManagerConfig {
            data_dir: dir.path().to_path_buf(),
            tablet: TabletConfig {
                flush_threshold_bytes: 1,
                ..Default::default()
            },
            scanner_ttl: Duration::ZERO,
            maintenance_interval: Duration::from_millis(10),
        };
        Arc::new(TabletManager::open(config).unwrap())
    }

    fn schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new("key", DataType::UInt32),
                ColumnSchema::new("val", DataType::UInt32),
            ],
            1,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pass_flushes_and_expires_scanners() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        let scanners = Arc::new(ScannerManager::new());
        let tablet = manager.create_tablet("t1", "table", schema(), None).unwrap();
        for i in 0..10u32 {
            let row = Row::from_values(&tablet.schema(), vec![Value::UInt32(i), Value::UInt32(i)]).unwrap();
            tablet.insert(row).unwrap();
        }
        let iter = tablet.new_row_iterator(&schema(), &[]).unwrap();
        scanners.register(Arc::new(Scanner::new("t1", iter)));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let busy = MaintenanceManager::run_pass(&manager, &scanners, Duration::ZERO).await;
        assert_eq!(busy, 1);
        assert_eq!(tablet.num_rowsets(), 1);
        assert_eq!(tablet.memrowset_size(), 0);
        assert_eq!(tablet.count_rows().unwrap(), 10);
        assert_eq!(scanners.count(), 0);

        // nothing left to do
        assert_eq!(MaintenanceManager::run_pass(&manager, &scanners, Duration::ZERO).await, 0);
    }

    #[tokio::test]
    async fn test_background_loop() {
        let dir = TempDir::new().unwrap();
        let manager = open(&dir);
        let tablet = manager.create_tablet("t1", "table", schema(), None).unwrap();
        let maintenance = MaintenanceManager::start(manager.clone(), Arc::new(ScannerManager::new()));

        let row = Row::from_values(&tablet.schema(), vec![Value::UInt32(1), Value::UInt32(1)]).unwrap();
        tablet.insert(row).unwrap();

        let mut flushed = false;
        for _ in 0..500 {
            if tablet.num_rowsets() > 0 {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flushed);
        maintenance.shutdown().await.unwrap();
        assert_eq!(tablet.count_rows().unwrap(), 1);
    }
}
