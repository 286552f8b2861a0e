use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::ScanConfig;

/// Timestamp format used for capture times stored in the session.
pub const CAPTURE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Placeholder destination recorded for photos sent to the system trash.
pub const RECYCLE_BIN_SENTINEL: &str = "[RECYCLE BIN]";

// Photo models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub path: String,
    pub file_name: String,
    pub file_size: i64,
    pub modified: i64,
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<String>,
    pub capture_time: Option<NaiveDateTime>,
    pub fingerprinted: bool,
    pub sharpness: f64,
    pub brightness: f64,
    pub quality_score: f64,
    pub faces: FaceSummary,
    pub scored: bool,
    pub cluster_id: Option<i64>,
    pub dup_kind: DupKind,
    pub event_id: Option<i64>,
    pub verdict: Verdict,
    pub user_override: bool,
    pub orphaned: bool,
    pub applied_batch: Option<i64>,
}

impl Photo {
    /// A freshly collected photo with no derived data yet.
    pub fn discovered(path: String, file_name: String, file_size: i64, modified: i64) -> Self {
        Self {
            path,
            file_name,
            file_size,
            modified,
            content_hash: None,
            perceptual_hash: None,
            capture_time: None,
            fingerprinted: false,
            sharpness: 0.0,
            brightness: 0.0,
            quality_score: 0.0,
            faces: FaceSummary::default(),
            scored: false,
            cluster_id: None,
            dup_kind: DupKind::None,
            event_id: None,
            verdict: Verdict::Review,
            user_override: false,
            orphaned: false,
            applied_batch: None,
        }
    }
}

/// Per-photo face aggregates. Expression averages are `None` when no face
/// was large enough to analyze.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceSummary {
    pub face_count: u32,
    pub eyes_open: Option<f64>,
    pub smile: Option<f64>,
    pub naturalness: Option<f64>,
    pub head_pose_frontal: Option<f64>,
    pub isolation: f64,
}

// Collection models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredFile {
    pub path: String,
    pub file_name: String,
    pub file_size: i64,
    pub modified: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub added: usize,
    pub changed: usize,
    pub orphaned: usize,
    pub restored: usize,
    pub unchanged: usize,
}

// Fingerprint and score results written back by the scan phases
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintRecord {
    pub path: String,
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<String>,
    pub capture_time: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub path: String,
    pub sharpness: f64,
    pub brightness: f64,
    pub quality_score: f64,
    pub faces: FaceSummary,
}

// Cluster models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub kind: ClusterKind,
    /// Member paths, ascending.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub path: String,
    pub cluster_id: i64,
    pub dup_kind: DupKind,
}

// Event models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub members: Vec<String>,
}

// Session models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub source_folder: String,
    pub schema_version: i32,
    pub config: ScanConfig,
    pub status: SessionStatus,
    /// Last phase whose results were committed.
    pub phase: Option<ScanPhase>,
    pub total_files: i64,
    pub processed_files: i64,
    pub last_batch_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

// Apply log models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyLogEntry {
    pub batch_id: i64,
    pub photo_path: String,
    pub source_path: String,
    pub destination: Destination,
    pub verdict: Verdict,
    pub success: bool,
    pub error: Option<String>,
    pub applied_at: String,
    pub undone: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: i64,
    pub applied_at: String,
    pub moved: i64,
    pub trashed: i64,
    pub failed: i64,
    pub undone: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Path(String),
    RecycleBin,
    /// Operation failed before a destination was chosen.
    Unassigned,
}

impl From<String> for Destination {
    fn from(s: String) -> Self {
        match s.as_str() {
            RECYCLE_BIN_SENTINEL => Destination::RecycleBin,
            "" => Destination::Unassigned,
            _ => Destination::Path(s),
        }
    }
}

impl From<Destination> for String {
    fn from(destination: Destination) -> Self {
        match destination {
            Destination::Path(path) => path,
            Destination::RecycleBin => RECYCLE_BIN_SENTINEL.to_string(),
            Destination::Unassigned => String::new(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Path(path) => f.write_str(path),
            Destination::RecycleBin => f.write_str(RECYCLE_BIN_SENTINEL),
            Destination::Unassigned => f.write_str("-"),
        }
    }
}

// Enums for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Keep,
    Archive,
    Delete,
    Review,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Keep => "KEEP",
            Verdict::Archive => "ARCHIVE",
            Verdict::Delete => "DELETE",
            Verdict::Review => "REVIEW",
        }
    }
}

impl From<String> for Verdict {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(Verdict::Review)
    }
}

impl From<Verdict> for String {
    fn from(verdict: Verdict) -> Self {
        verdict.as_str().to_string()
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KEEP" => Ok(Verdict::Keep),
            "ARCHIVE" => Ok(Verdict::Archive),
            "DELETE" => Ok(Verdict::Delete),
            "REVIEW" => Ok(Verdict::Review),
            other => Err(format!(
                "unknown verdict '{}', expected KEEP, ARCHIVE, DELETE or REVIEW",
                other
            )),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    Singleton,
    ExactDuplicate,
    NearDuplicate,
}

impl From<String> for ClusterKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "exact" => ClusterKind::ExactDuplicate,
            "near" => ClusterKind::NearDuplicate,
            _ => ClusterKind::Singleton,
        }
    }
}

impl From<ClusterKind> for String {
    fn from(kind: ClusterKind) -> Self {
        match kind {
            ClusterKind::Singleton => "singleton".to_string(),
            ClusterKind::ExactDuplicate => "exact".to_string(),
            ClusterKind::NearDuplicate => "near".to_string(),
        }
    }
}

/// How a photo relates to the rest of its cluster. `Exact` means at least
/// one other photo has the same content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DupKind {
    None,
    Exact,
    Near,
}

impl From<String> for DupKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "exact" => DupKind::Exact,
            "near" => DupKind::Near,
            _ => DupKind::None,
        }
    }
}

impl From<DupKind> for String {
    fn from(kind: DupKind) -> Self {
        match kind {
            DupKind::None => "none".to_string(),
            DupKind::Exact => "exact".to_string(),
            DupKind::Near => "near".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    New,
    Scanning,
    Scanned,
    Cancelled,
    Failed(String),
    Applied,
}

impl From<String> for SessionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "new" => SessionStatus::New,
            "scanning" => SessionStatus::Scanning,
            "scanned" => SessionStatus::Scanned,
            "cancelled" => SessionStatus::Cancelled,
            "applied" => SessionStatus::Applied,
            s if s.starts_with("failed:") => {
                SessionStatus::Failed(s.strip_prefix("failed:").unwrap_or("").to_string())
            }
            _ => SessionStatus::New,
        }
    }
}

impl From<SessionStatus> for String {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::New => "new".to_string(),
            SessionStatus::Scanning => "scanning".to_string(),
            SessionStatus::Scanned => "scanned".to_string(),
            SessionStatus::Cancelled => "cancelled".to_string(),
            SessionStatus::Failed(msg) => format!("failed:{}", msg),
            SessionStatus::Applied => "applied".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Collecting,
    Fingerprinting,
    Clustering,
    Scoring,
    Events,
    Suggesting,
    Complete,
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Collecting => "collecting",
            ScanPhase::Fingerprinting => "fingerprinting",
            ScanPhase::Clustering => "clustering",
            ScanPhase::Scoring => "scoring",
            ScanPhase::Events => "events",
            ScanPhase::Suggesting => "suggesting",
            ScanPhase::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collecting" => Some(ScanPhase::Collecting),
            "fingerprinting" => Some(ScanPhase::Fingerprinting),
            "clustering" => Some(ScanPhase::Clustering),
            "scoring" => Some(ScanPhase::Scoring),
            "events" => Some(ScanPhase::Events),
            "suggesting" => Some(ScanPhase::Suggesting),
            "complete" => Some(ScanPhase::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn format_capture_time(time: &NaiveDateTime) -> String {
    time.format(CAPTURE_TIME_FORMAT).to_string()
}

pub fn parse_capture_time(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, CAPTURE_TIME_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_parsing() {
        assert_eq!("keep".parse::<Verdict>().unwrap(), Verdict::Keep);
        assert_eq!("ARCHIVE".parse::<Verdict>().unwrap(), Verdict::Archive);
        assert!("maybe".parse::<Verdict>().is_err());
        assert_eq!(Verdict::from("garbage".to_string()), Verdict::Review);
        assert_eq!(String::from(Verdict::Delete), "DELETE");
    }

    #[test]
    fn test_session_status_failed_keeps_cause() {
        let stored = String::from(SessionStatus::Failed("disk full".to_string()));
        assert_eq!(stored, "failed:disk full");
        assert_eq!(
            SessionStatus::from(stored),
            SessionStatus::Failed("disk full".to_string())
        );
    }

    #[test]
    fn test_destination_sentinel() {
        assert_eq!(
            Destination::from(RECYCLE_BIN_SENTINEL.to_string()),
            Destination::RecycleBin
        );
        assert_eq!(String::from(Destination::RecycleBin), "[RECYCLE BIN]");
        assert_eq!(
            Destination::from("/a/03_KEEP/x.jpg".to_string()),
            Destination::Path("/a/03_KEEP/x.jpg".to_string())
        );
    }

    #[test]
    fn test_scan_phase_order() {
        assert!(ScanPhase::Collecting < ScanPhase::Fingerprinting);
        assert!(ScanPhase::Suggesting < ScanPhase::Complete);
        assert_eq!(ScanPhase::parse("scoring"), Some(ScanPhase::Scoring));
        assert_eq!(ScanPhase::parse("bogus"), None);
    }

    #[test]
    fn test_capture_time_text_form() {
        let time = NaiveDateTime::parse_from_str("2023-06-01 14:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let text = format_capture_time(&time);
        assert_eq!(text, "2023-06-01T14:30:00");
        assert_eq!(parse_capture_time(&text), Some(time));
    }
}
