/// Static description of a replica backend's I/O abilities.
///
/// The transfer engine picks its copy strategy purely from the source and
/// destination capability records: whether the destination can replace an
/// existing path atomically, whether one-shot bulk transfers are available,
/// whether fd-to-fd streaming with chunk resume is supported, and whether a
/// stat after writing is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaCapabilities {
    /// Destination supports atomic replace of an existing path.
    pub atomic_overwrite: bool,
    /// One-shot bulk upload primitive is available.
    pub put_support: bool,
    /// One-shot bulk download primitive is available.
    pub get_support: bool,
    /// fd-to-fd streaming with chunk resume is available.
    pub use_sendfile: bool,
    /// A stat after write is meaningful and affordable.
    pub do_post_copy_stat: bool,
}

impl ReplicaCapabilities {
    /// A plain local filesystem: no atomic overwrite, no bulk primitives.
    pub fn local_fs() -> Self {
        Self {
            atomic_overwrite: false,
            put_support: false,
            get_support: false,
            use_sendfile: true,
            do_post_copy_stat: true,
        }
    }

    /// The DAV backend: server writes are atomic, chunked streaming available.
    pub fn dav() -> Self {
        Self {
            atomic_overwrite: true,
            put_support: false,
            get_support: false,
            use_sendfile: true,
            do_post_copy_stat: true,
        }
    }
}
