/// Notification kinds delivered to the progress callback. Stable: GUI code
/// matches on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    StartSyncSequence,
    FinishedSyncSequence,
    StartUpload,
    FinishedUpload,
    StartDownload,
    FinishedDownload,
    StartDelete,
    EndDelete,
}

/// One progress notification.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    /// Replica-relative path, absent for the sequence markers.
    pub path: Option<String>,
    pub curr_bytes: i64,
    pub file_size: i64,
    pub overall_bytes: i64,
    pub overall_size: i64,
    pub file_no: u64,
    pub file_count: u64,
}

/// Totals for the whole run, filled by the count pass and advanced as
/// transfers start and finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverallProgress {
    pub file_count: u64,
    pub byte_sum: i64,
    pub current_file_no: u64,
    pub byte_current: i64,
}

pub type ProgressCallback = Box<dyn Fn(&ProgressEvent) + Send + Sync>;
