pub mod backoff;
pub mod caps;
pub mod dav;
pub mod local;
pub mod status;
pub mod vio;

pub use caps::ReplicaCapabilities;
pub use dav::{DavClient, DavConfig, RemoteStat};
pub use local::{LocalFs, current_euid, current_uid};
pub use status::{StatusCode, Severity, VioError, VioErrorKind, classify, close_severity};
pub use vio::{HbfInfo, Side, Vio, VioHandle, VioStat};
