use std::collections::BTreeMap;

use driftsync_core::Side;

use super::paths;

/// What kind of filesystem object an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Instruction computed by reconciliation. Input-only: propagation never
/// produces these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    New,
    Sync,
    Remove,
    Rename,
    Conflict,
}

impl Pending {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pending::New => "new",
            Pending::Sync => "sync",
            Pending::Remove => "remove",
            Pending::Rename => "rename",
            Pending::Conflict => "conflict",
        }
    }
}

/// Outcome written back by propagation for the statedb merger. Kept as a
/// separate type so a writeback can never be fed back in as an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated,
    Deleted,
    /// The operation failed in a way that should be retried next sync; the
    /// merger records the path as still present.
    None,
    Error,
}

impl Applied {
    pub fn as_str(&self) -> &'static str {
        match self {
            Applied::Updated => "updated",
            Applied::Deleted => "deleted",
            Applied::None => "none",
            Applied::Error => "error",
        }
    }
}

/// One reconciliation record describing an intended change at a path.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path: String,
    pub phash: u64,
    pub kind: EntryKind,
    pub pending: Pending,
    pub applied: Option<Applied>,
    pub modtime: i64,
    pub size: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub inode: u64,
    /// Server-assigned opaque file id; local files have none.
    pub fingerprint: Option<String>,
    /// Destination path, set only for rename entries.
    pub destpath: Option<String>,
    pub error_string: Option<String>,
    /// phash of the parent directory's path; filled in by the tree on insert.
    pub parent: Option<u64>,
}

impl Entry {
    pub fn file(path: &str, pending: Pending) -> Self {
        Self::new(path, EntryKind::File, pending)
    }

    pub fn dir(path: &str, pending: Pending) -> Self {
        Self::new(path, EntryKind::Directory, pending)
    }

    pub fn new(path: &str, kind: EntryKind, pending: Pending) -> Self {
        Self {
            path: path.to_string(),
            phash: path_hash(path),
            kind,
            pending,
            applied: None,
            modtime: 0,
            size: 0,
            mode: if kind == EntryKind::Directory {
                0o755
            } else {
                0o644
            },
            uid: 0,
            gid: 0,
            inode: 0,
            fingerprint: None,
            destpath: None,
            error_string: None,
            parent: None,
        }
    }

    /// Mark the entry failed. The first error string wins; a later, more
    /// generic message never overrides it.
    pub fn set_error(&mut self, message: &str) {
        self.applied = Some(Applied::Error);
        if self.error_string.is_none() && !message.is_empty() {
            self.error_string = Some(message.to_string());
        }
    }
}

/// 64-bit hash of a replica path, the tree key.
pub fn path_hash(path: &str) -> u64 {
    let digest = md5::compute(path.as_bytes());
    let b = digest.0;
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// One replica's reconciliation entries, ordered by path hash.
#[derive(Debug, Default)]
pub struct EntryTree {
    entries: BTreeMap<u64, Entry>,
}

impl EntryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mut entry: Entry) {
        entry.parent = paths::parent_of(&entry.path).map(|dir| path_hash(&dir));
        self.entries.insert(entry.phash, entry);
    }

    pub fn get(&self, phash: u64) -> Option<&Entry> {
        self.entries.get(&phash)
    }

    pub fn get_mut(&mut self, phash: u64) -> Option<&mut Entry> {
        self.entries.get_mut(&phash)
    }

    pub fn get_by_path(&self, path: &str) -> Option<&Entry> {
        self.entries.get(&path_hash(path))
    }

    pub fn replace(&mut self, entry: Entry) {
        self.entries.insert(entry.phash, entry);
    }

    /// Walk order of the tree: ascending path hash.
    pub fn phashes(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub const DIR_ERROR_MESSAGE: &str = "Error within the directory";

/// Both replicas' entry trees plus the cross-tree error propagation walk.
#[derive(Debug, Default)]
pub struct SyncTrees {
    pub local: EntryTree,
    pub remote: EntryTree,
}

impl SyncTrees {
    pub fn new(local: EntryTree, remote: EntryTree) -> Self {
        Self { local, remote }
    }

    pub fn tree(&self, side: Side) -> &EntryTree {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    pub fn tree_mut(&mut self, side: Side) -> &mut EntryTree {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }

    /// Mark every ancestor directory of a failed path as errored so the
    /// overall result reflects the regression. The walk follows the parent
    /// back-index filled in at insert time (a forest, never a cycle),
    /// looking each level up in the local tree first, then the remote one,
    /// and stops at the first level absent from both.
    pub fn mark_parent_error(&mut self, path: &str) {
        let mut next = paths::parent_of(path).map(|dir| path_hash(&dir));
        while let Some(h) = next {
            let entry = match self.local.get_mut(h) {
                Some(entry) => Some(entry),
                None => self.remote.get_mut(h),
            };
            let Some(entry) = entry else {
                return;
            };
            entry.set_error(DIR_ERROR_MESSAGE);
            next = entry.parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_links_parent_hash() {
        let mut tree = EntryTree::new();
        tree.insert(Entry::file("a/b/c.txt", Pending::New));
        let entry = tree.get_by_path("a/b/c.txt").unwrap();
        assert_eq!(entry.parent, Some(path_hash("a/b")));

        let mut top = EntryTree::new();
        top.insert(Entry::file("c.txt", Pending::New));
        assert_eq!(top.get_by_path("c.txt").unwrap().parent, None);
    }

    #[test]
    fn parent_error_walk_prefers_local_tree_and_stops_at_gaps() {
        let mut trees = SyncTrees::default();
        trees.local.insert(Entry::dir("a", Pending::Sync));
        trees.remote.insert(Entry::dir("a/b", Pending::Sync));

        trees.mark_parent_error("a/b/c.txt");

        assert_eq!(
            trees.remote.get_by_path("a/b").unwrap().applied,
            Some(Applied::Error)
        );
        assert_eq!(
            trees.local.get_by_path("a").unwrap().applied,
            Some(Applied::Error)
        );
        assert_eq!(
            trees.local.get_by_path("a").unwrap().error_string.as_deref(),
            Some(DIR_ERROR_MESSAGE)
        );
    }

    #[test]
    fn first_error_string_wins() {
        let mut entry = Entry::file("a.txt", Pending::New);
        entry.set_error("open failed");
        entry.set_error(DIR_ERROR_MESSAGE);
        assert_eq!(entry.error_string.as_deref(), Some("open failed"));
        assert_eq!(entry.applied, Some(Applied::Error));
    }
}
