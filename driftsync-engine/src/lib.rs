pub mod sync;

pub use sync::entry::{Applied, Entry, EntryKind, EntryTree, Pending, SyncTrees, path_hash};
pub use sync::journal::{JournalError, ProgressJournal, ResumeRecord};
pub use sync::progress::{OverallProgress, ProgressCallback, ProgressEvent, ProgressKind};
pub use sync::propagate::{
    IgnoredFiles, OpStatus, PropagateConfig, PropagateError, Propagator,
};
pub use sync::rename::RenameTable;
