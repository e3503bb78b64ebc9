//! The filesystem as seen by the process core.
//!
//! Path resolution and file contents are implemented elsewhere and reached
//! through [`Vfs`]. This module only deals with what a process holds on to:
//! custodies, descriptors, and its veil.

use alloc::sync::Arc;

use crate::{
    error::Result,
    fs::{
        fd::FileDescriptor,
        path::{FileName, Path},
    },
    user::{
        process::credentials::{Credentials, Gid, Uid},
        syscall::args::{FileMode, OpenFlags},
    },
};

pub mod fd;
pub mod path;
pub mod procfs;
pub mod unveil;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
    Link,
    CharDev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub ino: u64,
    pub ty: FileType,
    pub mode: FileMode,
    pub uid: Uid,
    pub gid: Gid,
}

/// A resolved node together with the canonical path used to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Custody {
    path: Path,
    metadata: Metadata,
}

impl Custody {
    pub fn new(path: Path, metadata: Metadata) -> Self {
        Self { path, metadata }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.ty == FileType::Dir
    }
}

/// The identity filesystem operations are performed with.
pub struct FileAccessContext {
    pub credentials: Arc<Credentials>,
}

pub trait Vfs: Send + Sync {
    /// Resolve a canonical absolute path.
    fn resolve(&self, path: &Path, ctx: &FileAccessContext) -> Result<Custody>;

    fn open(&self, custody: &Custody, flags: OpenFlags, ctx: &FileAccessContext)
    -> Result<FileDescriptor>;

    fn create(
        &self,
        parent: &Custody,
        name: &FileName,
        mode: FileMode,
        ctx: &FileAccessContext,
    ) -> Result<Custody>;
}

/// The root of the filesystem namespace a process sees.
pub struct VfsRootContext {
    vfs: Arc<dyn Vfs>,
    root: Custody,
}

impl VfsRootContext {
    pub fn new(vfs: Arc<dyn Vfs>, ctx: &FileAccessContext) -> Result<Self> {
        let root = vfs.resolve(&Path::root(), ctx)?;
        Ok(Self { vfs, root })
    }

    pub fn vfs(&self) -> &dyn Vfs {
        &*self.vfs
    }

    pub fn root(&self) -> &Custody {
        &self.root
    }
}
