pub mod commands;
pub mod config;
pub mod core;
pub mod database;
pub mod schema;

pub use commands::{ScanHandle, start_scan};
pub use config::ScanConfig;
pub use core::progress::{CancellationToken, ProgressReporter, ScanEvent, ScanProgress};
pub use core::scanner::{ScanStatus, ScanSummary};
pub use database::SessionStore;
pub use database::models::{Photo, ScanPhase, Verdict};
