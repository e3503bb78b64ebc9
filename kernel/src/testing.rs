//! In-memory collaborators for unit tests.

use std::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    vec::Vec,
};

use crate::{
    error::{Result, bail, ensure, err},
    fs::{
        Custody, FileAccessContext, FileType, Metadata, Vfs, VfsRootContext,
        fd::{FileDescriptor, OpenFileDescription},
        path::{FileName, Path},
    },
    memory::protected::PageProtection,
    spin::mutex::Mutex,
    user::{
        memory::{MemoryPermissions, VirtualMemory},
        process::{
            HostnameContext, Process, ProcessParams,
            credentials::{Credentials, Gid, Uid},
            exec::{LoadedImage, ProgramLoader},
        },
        registry::ProcessRegistry,
        syscall::args::{FileMode, OpenFlags},
        thread::Thread,
    },
};

pub const USER: Uid = Uid::new(1000);
pub const GROUP: Gid = Gid::new(1000);

/// Counts how often the protection was toggled.
#[derive(Clone, Default)]
pub struct CountingProtection {
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    unprotects: AtomicUsize,
    protects: AtomicUsize,
}

impl CountingProtection {
    pub fn unprotects(&self) -> usize {
        self.counters.unprotects.load(Ordering::SeqCst)
    }

    pub fn protects(&self) -> usize {
        self.counters.protects.load(Ordering::SeqCst)
    }
}

impl PageProtection for CountingProtection {
    fn unprotect(&self) {
        self.counters.unprotects.fetch_add(1, Ordering::SeqCst);
    }

    fn protect(&self) {
        self.counters.protects.fetch_add(1, Ordering::SeqCst);
    }

    fn is_writable(&self) -> bool {
        // Blocks protect themselves once when they're created.
        self.unprotects() >= self.protects()
    }
}

/// A description without contents that counts how often it was closed.
pub struct NullFile {
    pub closes: Arc<AtomicUsize>,
}

impl NullFile {
    pub fn new() -> Self {
        Self {
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl OpenFileDescription for NullFile {
    fn flags(&self) -> OpenFlags {
        OpenFlags::RDWR
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryNode {
    metadata: Metadata,
    contents: Arc<Mutex<Vec<u8>>>,
}

/// A flat map from canonical paths to nodes.
pub struct MemoryVfs {
    nodes: Mutex<BTreeMap<Vec<u8>, MemoryNode>>,
    next_ino: AtomicUsize,
}

impl MemoryVfs {
    pub fn new() -> Arc<Self> {
        let vfs = Arc::new(Self {
            nodes: Mutex::new(BTreeMap::new()),
            next_ino: AtomicUsize::new(1),
        });
        vfs.insert(&Path::root(), FileType::Dir, FileMode::from_bits_truncate(0o755), Uid::SUPER_USER, &[]);
        vfs
    }

    fn insert(&self, path: &Path, ty: FileType, mode: FileMode, uid: Uid, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            if !self.nodes.lock().contains_key(&parent.to_bytes()) {
                self.insert(&parent, FileType::Dir, FileMode::from_bits_truncate(0o755), Uid::SUPER_USER, &[]);
            }
        }

        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed) as u64;
        let node = MemoryNode {
            metadata: Metadata {
                ino,
                ty,
                mode,
                uid,
                gid: Gid::new(uid.get()),
            },
            contents: Arc::new(Mutex::new(contents.to_vec())),
        };
        self.nodes.lock().insert(path.to_bytes(), node);
    }

    pub fn add_dir(&self, path: &str) {
        let path = Path::new(path.as_bytes()).unwrap();
        self.insert(&path, FileType::Dir, FileMode::from_bits_truncate(0o755), Uid::SUPER_USER, &[]);
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        let path = Path::new(path.as_bytes()).unwrap();
        self.insert(&path, FileType::File, FileMode::from_bits_truncate(0o644), Uid::SUPER_USER, contents);
    }

    pub fn add_file_with(&self, path: &str, mode: FileMode, uid: Uid) {
        let path = Path::new(path.as_bytes()).unwrap();
        self.insert(&path, FileType::File, mode, uid, &[]);
    }

    /// Add an executable that `loader` loads at `entry`.
    pub fn add_program(&self, path: &str, loader: &ScriptLoader, entry: u64) {
        self.add_file_with(path, FileMode::from_bits_truncate(0o755), Uid::SUPER_USER);
        loader.add_program(path, entry);
    }

    /// Add an executable script.
    pub fn add_script(&self, path: &str, contents: &[u8]) {
        let path = Path::new(path.as_bytes()).unwrap();
        self.insert(&path, FileType::File, FileMode::from_bits_truncate(0o755), Uid::SUPER_USER, contents);
    }

    pub fn contents(&self, path: &str) -> Vec<u8> {
        let path = Path::new(path.as_bytes()).unwrap();
        self.nodes.lock()[&path.to_bytes()].contents.lock().clone()
    }
}

impl Vfs for MemoryVfs {
    fn resolve(&self, path: &Path, _ctx: &FileAccessContext) -> Result<Custody> {
        let guard = self.nodes.lock();
        let node = guard.get(&path.to_bytes()).ok_or(err!(NoEnt))?;
        Ok(Custody::new(path.clone(), node.metadata))
    }

    fn open(&self, custody: &Custody, flags: OpenFlags, _ctx: &FileAccessContext) -> Result<FileDescriptor> {
        if custody.is_dir() {
            ensure!(!flags.is_writable(), IsDir);
        } else {
            ensure!(!flags.contains(OpenFlags::DIRECTORY), NotDir);
        }

        let guard = self.nodes.lock();
        let node = guard.get(&custody.path().to_bytes()).ok_or(err!(NoEnt))?;
        if flags.contains(OpenFlags::TRUNC) && flags.is_writable() {
            node.contents.lock().clear();
        }
        Ok(FileDescriptor::from(MemoryFile {
            name: custody.path().to_string(),
            flags,
            contents: node.contents.clone(),
            offset: Mutex::new(0),
        }))
    }

    fn create(
        &self,
        parent: &Custody,
        name: &FileName,
        mode: FileMode,
        ctx: &FileAccessContext,
    ) -> Result<Custody> {
        ensure!(parent.is_dir(), NotDir);
        let path = parent.path().join(name);
        if self.nodes.lock().contains_key(&path.to_bytes()) {
            bail!(Exist);
        }
        self.insert(&path, FileType::File, mode, ctx.credentials.effective_user_id, &[]);
        self.resolve(&path, ctx)
    }
}

struct MemoryFile {
    name: String,
    flags: OpenFlags,
    contents: Arc<Mutex<Vec<u8>>>,
    offset: Mutex<usize>,
}

impl OpenFileDescription for MemoryFile {
    fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        ensure!(self.flags.is_readable(), BadF);
        let contents = self.contents.lock();
        let mut offset = self.offset.lock();
        let remaining = contents.get(*offset..).unwrap_or_default();
        let len = remaining.len().min(buf.len());
        buf[..len].copy_from_slice(&remaining[..len]);
        *offset += len;
        Ok(len)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        ensure!(self.flags.is_writable(), BadF);
        self.contents.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Loads registered programs and follows `#!` lines of everything else.
pub struct ScriptLoader {
    programs: Mutex<BTreeMap<Vec<u8>, u64>>,
}

impl ScriptLoader {
    pub fn new() -> Self {
        Self {
            programs: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_program(&self, path: &str, entry: u64) {
        self.programs.lock().insert(path.as_bytes().to_vec(), entry);
    }
}

impl ProgramLoader for ScriptLoader {
    fn load(&self, custody: &Custody, file: &FileDescriptor, memory: &VirtualMemory) -> Result<LoadedImage> {
        let entry = self.programs.lock().get(&custody.path().to_bytes()).copied();
        if let Some(entry) = entry {
            memory.map_anonymous(0x1000, MemoryPermissions::READ, false)?;
            return Ok(LoadedImage::Program { entry });
        }

        let mut header = [0; 128];
        let len = file.read(&mut header)?;
        LoadedImage::from_shebang(&header[..len])
    }
}

pub struct Fixture {
    pub registry: ProcessRegistry,
    /// The first thread of a process without a parent.
    pub thread: Arc<Thread>,
    pub vfs: Arc<MemoryVfs>,
    pub loader: ScriptLoader,
}

pub fn fixture() -> Fixture {
    build(ProcessRegistry::new())
}

pub fn fixture_with_protection(protection: CountingProtection) -> Fixture {
    build(ProcessRegistry::with_protection(move || {
        Box::new(protection.clone()) as Box<dyn PageProtection>
    }))
}

fn build(registry: ProcessRegistry) -> Fixture {
    let vfs = MemoryVfs::new();
    vfs.add_dir("/tmp");
    vfs.add_file("/etc/passwd", b"root:x:0:0::/root:/bin/sh\n");
    vfs.add_file("/etc/hosts", b"127.0.0.1 localhost\n");

    let credentials = Arc::new(Credentials::new(USER, GROUP));
    let ctx = FileAccessContext {
        credentials: credentials.clone(),
    };
    let vfs_root = Arc::new(VfsRootContext::new(vfs.clone(), &ctx).unwrap());
    let cwd = vfs_root.root().clone();

    let thread = Process::create(
        &registry,
        ProcessParams {
            name: b"init",
            credentials,
            vfs_root,
            hostname: Arc::new(HostnameContext::new(b"localhost").unwrap()),
            cwd,
            executable: None,
            entry: 0x1000,
            parent: None,
        },
    )
    .unwrap();

    Fixture {
        registry,
        thread,
        vfs,
        loader: ScriptLoader::new(),
    }
}
