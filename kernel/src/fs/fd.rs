use core::{any::type_name, cmp, ops::Deref};

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use log::debug;

use crate::{
    error::{Result, bail, ensure, err},
    rt::mutex::Mutex,
    user::syscall::args::{FdFlags, FdNum, OpenFlags},
};

/// A shared reference to an open file description.
///
/// Descriptor table slots, forked tables and `dup`ed numbers all hold clones
/// of the same handle. The description is closed when the last clone is
/// dropped.
#[derive(Clone)]
pub struct FileDescriptor(Arc<Description>);

#[cfg(test)]
impl core::fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("FileDescriptor").finish_non_exhaustive()
    }
}

struct Description(Box<dyn OpenFileDescription>);

impl Drop for Description {
    fn drop(&mut self) {
        if let Err(err) = self.0.close() {
            debug!("closing {} failed: {err:?}", self.0.name());
        }
    }
}

impl FileDescriptor {
    /// Returns whether both descriptors refer to the same open file
    /// description.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> From<T> for FileDescriptor
where
    T: OpenFileDescription,
{
    fn from(value: T) -> Self {
        FileDescriptor(Arc::new(Description(Box::new(value))))
    }
}

impl Deref for FileDescriptor {
    type Target = dyn OpenFileDescription;

    fn deref(&self) -> &Self::Target {
        &*self.0.0
    }
}

pub trait OpenFileDescription: Send + Sync + 'static {
    fn flags(&self) -> OpenFlags;

    /// A human readable name, e.g. the path the file was opened at.
    fn name(&self) -> String {
        String::from(type_name::<Self>())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _ = buf;
        bail!(Inval)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let _ = buf;
        bail!(Inval)
    }

    /// Called once when the last descriptor referring to the description
    /// is gone.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

enum Slot {
    Empty,
    /// Reserved by an [`FdAllocation`] that hasn't been committed yet.
    Allocated,
    Valid(FileDescriptorTableEntry),
}

impl Slot {
    fn entry(&self) -> Result<&FileDescriptorTableEntry> {
        match self {
            Slot::Valid(entry) => Ok(entry),
            Slot::Empty | Slot::Allocated => bail!(BadF),
        }
    }
}

#[derive(Clone)]
struct FileDescriptorTableEntry {
    fd: FileDescriptor,
    flags: FdFlags,
}

/// A process's file descriptors.
///
/// The table is guarded by a blocking mutex. Descriptions are always closed
/// after the lock has been released.
pub struct FileDescriptorTable {
    table: Mutex<Vec<Slot>>,
}

impl FileDescriptorTable {
    pub const MAX_FD: i32 = 0x10000;

    pub const fn empty() -> Self {
        Self {
            table: Mutex::new(Vec::new()),
        }
    }

    fn capacity(limit: u64) -> usize {
        cmp::min(limit, Self::MAX_FD as u64) as usize
    }

    /// Reserve the lowest free descriptor number that's at least `hint`.
    ///
    /// The table grows up to `limit` slots. The reservation is released
    /// again unless it's committed.
    pub fn allocate(&self, hint: FdNum, limit: u64) -> Result<FdAllocation<'_>> {
        let capacity = Self::capacity(limit);
        let hint = usize::try_from(hint.get())?;

        let mut guard = self.table.lock();
        let free = guard
            .iter()
            .enumerate()
            .take(capacity)
            .skip(hint)
            .find(|(_, slot)| matches!(slot, Slot::Empty))
            .map(|(idx, _)| idx);
        let idx = match free {
            Some(idx) => idx,
            None => {
                let idx = cmp::max(guard.len(), hint);
                ensure!(idx < capacity, Mfile);
                guard.resize_with(idx + 1, || Slot::Empty);
                idx
            }
        };
        guard[idx] = Slot::Allocated;

        Ok(FdAllocation {
            table: self,
            num: FdNum::new(idx as i32),
            committed: false,
        })
    }

    /// Insert a description at the lowest free descriptor number.
    pub fn insert(
        &self,
        fd: impl Into<FileDescriptor>,
        flags: FdFlags,
        limit: u64,
    ) -> Result<FdNum> {
        let allocation = self.allocate(FdNum::new(0), limit)?;
        Ok(allocation.commit(fd.into(), flags))
    }

    pub fn get(&self, fd_num: FdNum) -> Result<FileDescriptor> {
        let guard = self.table.lock();
        let slot = Self::slot(&guard, fd_num)?;
        Ok(slot.entry()?.fd.clone())
    }

    pub fn flags(&self, fd_num: FdNum) -> Result<FdFlags> {
        let guard = self.table.lock();
        let slot = Self::slot(&guard, fd_num)?;
        Ok(slot.entry()?.flags)
    }

    pub fn set_flags(&self, fd_num: FdNum, flags: FdFlags) -> Result<()> {
        let mut guard = self.table.lock();
        let idx = usize::try_from(fd_num.get()).map_err(|_| err!(BadF))?;
        match guard.get_mut(idx) {
            Some(Slot::Valid(entry)) => {
                entry.flags = flags;
                Ok(())
            }
            _ => bail!(BadF),
        }
    }

    fn slot(table: &[Slot], fd_num: FdNum) -> Result<&Slot> {
        let idx = usize::try_from(fd_num.get()).map_err(|_| err!(BadF))?;
        table.get(idx).ok_or(err!(BadF))
    }

    pub fn close(&self, fd_num: FdNum) -> Result<()> {
        let mut guard = self.table.lock();
        let idx = usize::try_from(fd_num.get()).map_err(|_| err!(BadF))?;
        let slot = guard.get_mut(idx).ok_or(err!(BadF))?;
        slot.entry()?;
        let Slot::Valid(entry) = core::mem::replace(slot, Slot::Empty) else {
            unreachable!()
        };
        drop(guard);

        drop(entry);
        Ok(())
    }

    /// Make `new` refer to the same description as `old`.
    ///
    /// A description previously open at `new` is closed.
    pub fn duplicate(&self, old: FdNum, new: FdNum, limit: u64) -> Result<FdNum> {
        let new_idx = usize::try_from(new.get()).map_err(|_| err!(BadF))?;
        ensure!(new_idx < Self::capacity(limit), BadF);

        let mut guard = self.table.lock();
        let fd = Self::slot(&guard, old)?.entry()?.fd.clone();
        if old == new {
            return Ok(new);
        }

        if guard.len() <= new_idx {
            guard.resize_with(new_idx + 1, || Slot::Empty);
        }
        let slot = &mut guard[new_idx];
        ensure!(!matches!(slot, Slot::Allocated), Again);
        let replaced = core::mem::replace(
            slot,
            Slot::Valid(FileDescriptorTableEntry {
                fd,
                flags: FdFlags::empty(),
            }),
        );
        drop(guard);
        drop(replaced);

        Ok(new)
    }

    /// Duplicate `old` to the lowest free descriptor number that's at least
    /// `min`.
    pub fn duplicate_from(
        &self,
        old: FdNum,
        min: FdNum,
        flags: FdFlags,
        limit: u64,
    ) -> Result<FdNum> {
        let fd = self.get(old)?;
        ensure!(
            usize::try_from(min.get()).is_ok_and(|min| min < Self::capacity(limit)),
            Inval
        );
        let allocation = self.allocate(min, limit)?;
        Ok(allocation.commit(fd, flags))
    }

    /// The number of slots that are in use.
    pub fn open_count(&self) -> usize {
        self.table
            .lock()
            .iter()
            .filter(|slot| !matches!(slot, Slot::Empty))
            .count()
    }

    pub fn entries(&self) -> Vec<(FdNum, FileDescriptor, FdFlags)> {
        self.table
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Slot::Valid(entry) => {
                    Some((FdNum::new(idx as i32), entry.fd.clone(), entry.flags))
                }
                Slot::Empty | Slot::Allocated => None,
            })
            .collect()
    }

    /// Create the table of a forked child. Both tables share the open file
    /// descriptions.
    pub fn fork_copy(&self) -> Self {
        let table = self
            .table
            .lock()
            .iter()
            .map(|slot| match slot {
                Slot::Valid(entry) => Slot::Valid(entry.clone()),
                Slot::Empty | Slot::Allocated => Slot::Empty,
            })
            .collect();
        Self {
            table: Mutex::new(table),
        }
    }

    /// Close all descriptors marked close-on-exec.
    pub fn close_on_exec(&self) {
        self.close_matching(|entry| entry.flags.contains(FdFlags::CLOEXEC));
    }

    /// Close all descriptors.
    pub fn close_all(&self) {
        self.close_matching(|_| true);
    }

    fn close_matching(&self, mut f: impl FnMut(&FileDescriptorTableEntry) -> bool) {
        let mut closed = Vec::new();
        let mut guard = self.table.lock();
        for slot in guard.iter_mut() {
            if matches!(slot, Slot::Valid(entry) if f(entry)) {
                let Slot::Valid(entry) = core::mem::replace(slot, Slot::Empty) else {
                    unreachable!()
                };
                closed.push(entry);
            }
        }
        drop(guard);
        drop(closed);
    }
}

/// A reserved descriptor number.
///
/// Dropping the allocation without committing it frees the number again.
pub struct FdAllocation<'a> {
    table: &'a FileDescriptorTable,
    num: FdNum,
    committed: bool,
}

impl FdAllocation<'_> {
    pub fn num(&self) -> FdNum {
        self.num
    }

    pub fn commit(mut self, fd: FileDescriptor, flags: FdFlags) -> FdNum {
        let mut guard = self.table.table.lock();
        let slot = &mut guard[self.num.get() as usize];
        assert!(
            matches!(slot, Slot::Allocated),
            "committed fd {} isn't allocated",
            self.num
        );
        *slot = Slot::Valid(FileDescriptorTableEntry { fd, flags });
        self.committed = true;
        self.num
    }
}

impl Drop for FdAllocation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        let mut guard = self.table.table.lock();
        let slot = &mut guard[self.num.get() as usize];
        assert!(
            matches!(slot, Slot::Allocated),
            "released fd {} isn't allocated",
            self.num
        );
        *slot = Slot::Empty;
    }
}
