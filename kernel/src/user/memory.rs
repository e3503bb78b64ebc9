//! A minimal model of a process's address space.
//!
//! The address space is a map from start addresses to mappings. Each mapping
//! exposes a window of a [`VmObject`]. Page tables are maintained elsewhere.

use core::{
    fmt::{self, Display},
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

use alloc::{collections::BTreeMap, sync::Arc, vec, vec::Vec};
use bitflags::bitflags;
use bytemuck::{bytes_of, bytes_of_mut};
use usize_conversions::{FromUsize, usize_from};
use x86_64::{VirtAddr, align_up};

use crate::{
    error::{Result, bail, ensure, err},
    spin::{mutex::Mutex, rwlock::RwLock},
    user::futex::GlobalFutexKey,
};

pub const PAGE_SIZE: u64 = 0x1000;

const MMAP_BASE: u64 = 0x1000_0000;

fn new_id() -> u64 {
    static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
    ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct MemoryPermissions: u8 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

impl Display for MemoryPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use fmt::Write;

        f.write_char(if self.contains(Self::READ) { 'r' } else { '-' })?;
        f.write_char(if self.contains(Self::WRITE) { 'w' } else { '-' })?;
        f.write_char(if self.contains(Self::EXECUTE) {
            'x'
        } else {
            '-'
        })
    }
}

/// Memory that can be mapped into one or more address spaces.
pub struct VmObject {
    id: u64,
    bytes: Mutex<Vec<u8>>,
}

impl VmObject {
    pub fn zeroed(len: usize) -> Arc<Self> {
        Arc::new(Self {
            id: new_id(),
            bytes: Mutex::new(vec![0; len]),
        })
    }

    pub fn with_contents(bytes: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            id: new_id(),
            bytes: Mutex::new(bytes.to_vec()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let guard = self.bytes.lock();
        let end = offset.checked_add(buf.len()).ok_or(err!(Fault))?;
        let src = guard.get(offset..end).ok_or(err!(Fault))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let mut guard = self.bytes.lock();
        let end = offset.checked_add(buf.len()).ok_or(err!(Fault))?;
        let dst = guard.get_mut(offset..end).ok_or(err!(Fault))?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    /// Create a private copy with a new identity.
    fn duplicate(&self) -> Arc<Self> {
        Arc::new(Self {
            id: new_id(),
            bytes: Mutex::new(self.bytes.lock().clone()),
        })
    }
}

#[derive(Clone)]
struct Mapping {
    len: u64,
    object: Arc<VmObject>,
    /// Offset of the start of the mapping within the object.
    offset: u64,
    permissions: MemoryPermissions,
    shared: bool,
}

impl Mapping {
    fn contains(&self, start: VirtAddr, addr: VirtAddr) -> bool {
        addr.as_u64() - start.as_u64() < self.len
    }
}

/// The 32-bit word a futex operates on.
pub struct FutexWord {
    object: Arc<VmObject>,
    offset: usize,
}

impl FutexWord {
    pub fn load(&self) -> Result<u32> {
        let mut value = 0u32;
        self.object.read(self.offset, bytes_of_mut(&mut value))?;
        Ok(value)
    }
}

pub struct VirtualMemory {
    id: u64,
    state: RwLock<VirtualMemoryState>,
}

struct VirtualMemoryState {
    mappings: BTreeMap<VirtAddr, Mapping>,
    next_addr: u64,
}

impl VirtualMemory {
    pub fn new() -> Self {
        Self {
            id: new_id(),
            state: RwLock::new(VirtualMemoryState {
                mappings: BTreeMap::new(),
                next_addr: MMAP_BASE,
            }),
        }
    }

    /// The identity of the address space.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Map `len` bytes of `object` starting at `offset`.
    ///
    /// Without an address, the mapping is placed above all dynamic mappings
    /// created so far.
    pub fn map(
        &self,
        addr: Option<VirtAddr>,
        len: u64,
        object: Arc<VmObject>,
        offset: u64,
        permissions: MemoryPermissions,
        shared: bool,
    ) -> Result<VirtAddr> {
        ensure!(len != 0, Inval);
        ensure!(offset % PAGE_SIZE == 0, Inval);
        let end_offset = offset.checked_add(len).ok_or(err!(Inval))?;
        ensure!(end_offset <= u64::from_usize(object.len()), Inval);

        let mut guard = self.state.write();
        let start = match addr {
            Some(addr) => {
                ensure!(addr.is_aligned(PAGE_SIZE), Inval);
                let end = addr.as_u64().checked_add(len).ok_or(err!(Inval))?;
                VirtAddr::try_new(end)?;
                let overlaps = guard
                    .mappings
                    .range(..VirtAddr::new(end))
                    .next_back()
                    .is_some_and(|(start, mapping)| start.as_u64() + mapping.len > addr.as_u64());
                ensure!(!overlaps, Inval);
                addr
            }
            None => {
                let start = VirtAddr::try_new(guard.next_addr)?;
                guard.next_addr = align_up(guard.next_addr + len, PAGE_SIZE) + PAGE_SIZE;
                start
            }
        };

        guard.mappings.insert(
            start,
            Mapping {
                len,
                object,
                offset,
                permissions,
                shared,
            },
        );
        Ok(start)
    }

    pub fn map_anonymous(
        &self,
        len: u64,
        permissions: MemoryPermissions,
        shared: bool,
    ) -> Result<VirtAddr> {
        let len = align_up(len, PAGE_SIZE);
        let object = VmObject::zeroed(usize_from(len));
        self.map(None, len, object, 0, permissions, shared)
    }

    /// Map a private read-write region for a thread's stack.
    pub fn allocate_stack(&self, len: u64) -> Result<Range<VirtAddr>> {
        let start = self.map_anonymous(
            len,
            MemoryPermissions::READ | MemoryPermissions::WRITE,
            false,
        )?;
        Ok(start..start + align_up(len, PAGE_SIZE))
    }

    /// Remove the mapping starting at `addr`.
    pub fn unmap(&self, addr: VirtAddr) -> Result<()> {
        let mut guard = self.state.write();
        guard.mappings.remove(&addr).ok_or(err!(Inval))?;
        Ok(())
    }

    /// Returns whether all of `range` is mapped.
    pub fn is_mapped(&self, range: Range<VirtAddr>) -> bool {
        let guard = self.state.read();
        let mut addr = range.start;
        while addr < range.end {
            let Some((start, mapping)) = guard.mappings.range(..=addr).next_back() else {
                return false;
            };
            if !mapping.contains(*start, addr) {
                return false;
            }
            addr = *start + mapping.len;
        }
        true
    }

    fn with_mapping<R>(
        &self,
        addr: u64,
        f: impl FnOnce(VirtAddr, VirtAddr, &Mapping) -> R,
    ) -> Result<R> {
        let addr = VirtAddr::try_new(addr)?;
        let guard = self.state.read();
        let (start, mapping) = guard
            .mappings
            .range(..=addr)
            .next_back()
            .filter(|(start, mapping)| mapping.contains(**start, addr))
            .ok_or(err!(Fault))?;
        Ok(f(addr, *start, mapping))
    }

    /// Derive the identity of the futex word at `addr`.
    ///
    /// Shared keys identify the word by its backing object, so they're the
    /// same in every address space mapping the object. Private keys are only
    /// meaningful within this address space.
    pub fn futex_key(&self, addr: u64, shared: bool) -> Result<GlobalFutexKey> {
        ensure!(addr % 4 == 0, Inval);
        self.with_mapping(addr, |addr, start, mapping| {
            if shared {
                GlobalFutexKey::Shared {
                    object: mapping.object.id(),
                    offset: mapping.offset + (addr - start),
                }
            } else {
                GlobalFutexKey::Private {
                    address_space: self.id,
                    address: addr.as_u64(),
                }
            }
        })
    }

    pub fn futex_word(&self, addr: u64) -> Result<FutexWord> {
        ensure!(addr % 4 == 0, Inval);
        self.with_mapping(addr, |addr, start, mapping| FutexWord {
            object: mapping.object.clone(),
            offset: usize_from(mapping.offset + (addr - start)),
        })
    }

    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (object, offset) = self.locate(addr, buf.len(), MemoryPermissions::READ)?;
        object.read(offset, buf)
    }

    pub fn write_bytes(&self, addr: u64, buf: &[u8]) -> Result<()> {
        let (object, offset) = self.locate(addr, buf.len(), MemoryPermissions::WRITE)?;
        object.write(offset, buf)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        let mut value = 0u32;
        self.read_bytes(addr, bytes_of_mut(&mut value))?;
        Ok(value)
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<()> {
        self.write_bytes(addr, bytes_of(&value))
    }

    fn locate(
        &self,
        addr: u64,
        len: usize,
        required: MemoryPermissions,
    ) -> Result<(Arc<VmObject>, usize)> {
        self.with_mapping(addr, |addr, start, mapping| {
            let rel = addr - start;
            if !mapping.permissions.contains(required) || rel + u64::from_usize(len) > mapping.len
            {
                bail!(Fault);
            }
            Ok((mapping.object.clone(), usize_from(mapping.offset + rel)))
        })?
    }

    /// Create the address space of a forked child. Shared mappings keep
    /// their objects, private ones are copied.
    pub fn fork(&self) -> Self {
        let guard = self.state.read();
        let mappings = guard
            .mappings
            .iter()
            .map(|(start, mapping)| {
                let mut mapping = mapping.clone();
                if !mapping.shared {
                    mapping.object = mapping.object.duplicate();
                }
                (*start, mapping)
            })
            .collect();
        Self {
            id: new_id(),
            state: RwLock::new(VirtualMemoryState {
                mappings,
                next_addr: guard.next_addr,
            }),
        }
    }

    /// Total number of mapped bytes.
    pub fn size(&self) -> u64 {
        self.state.read().mappings.values().map(|m| m.len).sum()
    }
}

impl Default for VirtualMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use x86_64::VirtAddr;

    use super::{MemoryPermissions, PAGE_SIZE, VirtualMemory, VmObject};
    use crate::{error::ErrorKind, user::futex::GlobalFutexKey};

    const RW: MemoryPermissions = MemoryPermissions::READ.union(MemoryPermissions::WRITE);

    #[test]
    fn shared_and_private_keys_never_collide() {
        let vm = VirtualMemory::new();
        let addr = vm.map_anonymous(PAGE_SIZE, RW, true).unwrap().as_u64();
        for offset in [0, 4, 0x800] {
            let shared = vm.futex_key(addr + offset, true).unwrap();
            let private = vm.futex_key(addr + offset, false).unwrap();
            assert_ne!(shared, private);
        }
    }

    #[test]
    fn shared_keys_agree_across_address_spaces() {
        let object = VmObject::zeroed(2 * PAGE_SIZE as usize);
        let a = VirtualMemory::new();
        let b = VirtualMemory::new();
        let in_a = a
            .map(None, 2 * PAGE_SIZE, object.clone(), 0, RW, true)
            .unwrap();
        let in_b = b
            .map(
                Some(VirtAddr::new(0x4000_0000)),
                PAGE_SIZE,
                object.clone(),
                PAGE_SIZE,
                RW,
                true,
            )
            .unwrap();

        let key_a = a.futex_key(in_a.as_u64() + PAGE_SIZE + 8, true).unwrap();
        let key_b = b.futex_key(in_b.as_u64() + 8, true).unwrap();
        assert_eq!(key_a, key_b);
        assert_eq!(
            key_a,
            GlobalFutexKey::Shared {
                object: object.id(),
                offset: PAGE_SIZE + 8
            }
        );

        let private_a = a.futex_key(in_a.as_u64(), false).unwrap();
        let private_b = b.futex_key(in_b.as_u64(), false).unwrap();
        assert_ne!(private_a, private_b);
    }

    #[test]
    fn bad_futex_addresses() {
        let vm = VirtualMemory::new();
        let addr = vm.map_anonymous(PAGE_SIZE, RW, false).unwrap().as_u64();
        assert_eq!(vm.futex_key(addr + 2, false).unwrap_err(), ErrorKind::Inval);
        assert_eq!(
            vm.futex_key(addr + PAGE_SIZE, false).unwrap_err(),
            ErrorKind::Fault
        );
        assert_eq!(
            vm.futex_key(0x8000_0000_0000, true).unwrap_err(),
            ErrorKind::Fault
        );
    }

    #[test]
    fn fork_copies_private_memory() {
        let vm = VirtualMemory::new();
        let private = vm.map_anonymous(PAGE_SIZE, RW, false).unwrap().as_u64();
        let shared = vm.map_anonymous(PAGE_SIZE, RW, true).unwrap().as_u64();
        vm.write_u32(private, 1).unwrap();

        let child = vm.fork();
        child.write_u32(private, 2).unwrap();
        child.write_u32(shared, 3).unwrap();

        assert_eq!(vm.read_u32(private).unwrap(), 1);
        assert_eq!(vm.read_u32(shared).unwrap(), 3);
        assert_eq!(
            vm.futex_key(shared, true).unwrap(),
            child.futex_key(shared, true).unwrap()
        );
    }

    #[test]
    fn fixed_mappings_must_not_overlap() {
        let vm = VirtualMemory::new();
        let object = VmObject::zeroed(4 * PAGE_SIZE as usize);
        let base = VirtAddr::new(0x2000_0000);
        vm.map(Some(base), 2 * PAGE_SIZE, object.clone(), 0, RW, false)
            .unwrap();
        assert_eq!(
            vm.map(Some(base + PAGE_SIZE), PAGE_SIZE, object.clone(), 0, RW, false)
                .unwrap_err(),
            ErrorKind::Inval
        );
        assert!(vm.is_mapped(base..base + 2 * PAGE_SIZE));
        assert!(!vm.is_mapped(base..base + 3 * PAGE_SIZE));
    }
}
