//! Tablet server: hosted tablets, scanners and request handling

mod maintenance;
mod manager;
mod protocol;
mod scanners;
mod service;

pub use maintenance::MaintenanceManager;
pub use manager::{TabletManager, TabletManagerConfig};
pub use protocol::*;
pub use scanners::{Scanner, ScannerManager};
pub use service::{TabletServerService, TabletServiceImpl};
