//! Direct mappings for requests the superblocks cannot serve.
//!
//! Every mapping starts with a [`MappingHeader`] whose trailing block header
//! sits right in front of the user pointer. Live mappings are also recorded in
//! a registry, so a stale or foreign pointer is rejected before any of its
//! memory is read.

use core::{
  cell::UnsafeCell,
  mem::{self, size_of},
  ptr::{NonNull, null_mut},
};

use crate::{
  arena::align_up,
  error::Error,
  platform,
  size_class::OVERSIZE_CLASS,
  stats,
  superblock::{BLOCK_MAPPED, BlockHeader, HEADER_SIZE},
  sync::SpinLock,
};

#[repr(C, align(16))]
struct MappingHeader {
  base: *mut u8,
  len: usize,
  block: BlockHeader,
}

const MAPPING_HEADER: usize = size_of::<MappingHeader>();

const _: () = assert!(MAPPING_HEADER == 32);

// =============================================================================
// Registry
// =============================================================================

const EMPTY: usize = 0;
const TOMBSTONE: usize = 1;
const MIN_SLOTS: usize = 512;

/// Open-addressed slot array. Keys are user pointers, which are 16-aligned
/// and never collide with `EMPTY` or `TOMBSTONE`.
struct Table {
  slots: *mut usize,
  cap: usize,
  /// Slots holding a key or a tombstone.
  used: usize,
  live: usize,
}

impl Table {
  #[inline]
  fn slot_of(&self, key: usize) -> usize {
    (((key as u64 >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 16) as usize) & (self.cap - 1)
  }

  fn find(&self, key: usize) -> Option<usize> {
    if self.cap == 0 {
      return None;
    }
    let mut i = self.slot_of(key);
    loop {
      match unsafe { *self.slots.add(i) } {
        EMPTY => return None,
        k if k == key => return Some(i),
        _ => i = (i + 1) & (self.cap - 1),
      }
    }
  }

  /// Caller made sure a free slot exists and `key` is absent.
  unsafe fn put(&mut self, key: usize) {
    let mut i = self.slot_of(key);
    loop {
      let slot = unsafe { &mut *self.slots.add(i) };
      match *slot {
        EMPTY => {
          self.used += 1;
          break;
        }
        TOMBSTONE => break,
        _ => i = (i + 1) & (self.cap - 1),
      }
    }
    unsafe { *self.slots.add(i) = key };
    self.live += 1;
  }

  /// Rehashes into a fresh mapping, doubling when more than half the slots
  /// are live. Tombstones are dropped.
  fn rehash(&mut self) -> Result<(), Error> {
    let cap = if self.live * 2 >= self.cap {
      (self.cap * 2).max(MIN_SLOTS)
    } else {
      self.cap.max(MIN_SLOTS)
    };
    let slots = unsafe { platform::os_mmap(cap * size_of::<usize>(), false) }.cast::<usize>();
    if slots.is_null() {
      return Err(Error::OutOfMemory);
    }

    let old = mem::replace(
      self,
      Table {
        slots,
        cap,
        used: 0,
        live: 0,
      },
    );
    for i in 0..old.cap {
      let key = unsafe { *old.slots.add(i) };
      if key > TOMBSTONE {
        unsafe { self.put(key) };
      }
    }
    old.release();
    Ok(())
  }

  fn release(self) {
    if !self.slots.is_null() {
      unsafe { platform::os_munmap(self.slots.cast(), self.cap * size_of::<usize>()) };
    }
  }
}

/// Set of live mapping addresses. Its storage comes straight from the OS so
/// it never allocates through the allocator it serves.
struct Registry {
  lock: SpinLock,
  table: UnsafeCell<Table>,
}

unsafe impl Sync for Registry {}
unsafe impl Send for Registry {}

static REGISTRY: Registry = Registry::new();

impl Registry {
  const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      table: UnsafeCell::new(Table {
        slots: null_mut(),
        cap: 0,
        used: 0,
        live: 0,
      }),
    }
  }

  fn insert(&self, key: usize) -> Result<(), Error> {
    debug_assert!(key > TOMBSTONE);
    let _g = self.lock.lock();
    let table = unsafe { &mut *self.table.get() };
    debug_assert!(table.find(key).is_none());
    if (table.used + 1) * 4 > table.cap * 3 {
      table.rehash()?;
    }
    unsafe { table.put(key) };
    Ok(())
  }

  /// Whether `key` was present.
  fn remove(&self, key: usize) -> bool {
    let _g = self.lock.lock();
    let table = unsafe { &mut *self.table.get() };
    let Some(i) = table.find(key) else {
      return false;
    };
    unsafe { *table.slots.add(i) = TOMBSTONE };
    table.live -= 1;
    true
  }

  fn contains(&self, key: usize) -> bool {
    let _g = self.lock.lock();
    unsafe { &*self.table.get() }.find(key).is_some()
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    let _g = self.lock.lock();
    unsafe { &*self.table.get() }.live
  }
}

impl Drop for Registry {
  fn drop(&mut self) {
    let table = mem::replace(
      self.table.get_mut(),
      Table {
        slots: null_mut(),
        cap: 0,
        used: 0,
        live: 0,
      },
    );
    table.release();
  }
}

// =============================================================================
// Mappings
// =============================================================================

/// Maps a block of at least `size` usable bytes aligned to `align`.
pub(crate) fn map(size: usize, align: usize, page_size: usize) -> Result<NonNull<u8>, Error> {
  debug_assert!(align.is_power_of_two());
  let slack = if align > HEADER_SIZE { align } else { 0 };
  let len = size
    .checked_add(MAPPING_HEADER + slack)
    .filter(|n| *n <= isize::MAX as usize - page_size)
    .map(|n| align_up(n, page_size))
    .ok_or(Error::OutOfMemory)?;

  let base = unsafe { platform::os_mmap(len, false) };
  if base.is_null() {
    return Err(Error::OutOfMemory);
  }

  let user = align_up(base as usize + MAPPING_HEADER, align.max(HEADER_SIZE));
  debug_assert!(user + size <= base as usize + len);
  let header = (user - MAPPING_HEADER) as *mut MappingHeader;
  unsafe {
    header.write(MappingHeader {
      base,
      len,
      block: BlockHeader {
        next: null_mut(),
        class: OVERSIZE_CLASS,
        magic: BLOCK_MAPPED,
      },
    });
  }

  if let Err(e) = REGISTRY.insert(user) {
    unsafe { platform::os_munmap(base, len) };
    return Err(e);
  }
  stats::COUNTERS.mapped(len);
  Ok(unsafe { NonNull::new_unchecked(user as *mut u8) })
}

/// Whether `ptr` is the user pointer of a live direct mapping. Never reads
/// through `ptr`.
#[inline]
pub(crate) fn is_live(ptr: NonNull<u8>) -> bool {
  REGISTRY.contains(ptr.as_ptr() as usize)
}

#[inline]
unsafe fn mapping_of(ptr: NonNull<u8>) -> *mut MappingHeader {
  unsafe { ptr.as_ptr().sub(MAPPING_HEADER).cast() }
}

/// Unmaps the mapping whose user pointer is `ptr`.
pub(crate) unsafe fn unmap(ptr: NonNull<u8>) -> Result<(), Error> {
  let user = ptr.as_ptr() as usize;
  if !REGISTRY.remove(user) {
    return Err(Error::InvalidFree(user));
  }

  let (base, len) = unsafe {
    let m = mapping_of(ptr);
    debug_assert_eq!((*m).block.magic, BLOCK_MAPPED);
    ((*m).base, (*m).len)
  };
  if !unsafe { platform::os_munmap(base, len) } {
    return Err(Error::InvalidFree(user));
  }
  stats::COUNTERS.unmapped(len);
  Ok(())
}

/// Usable bytes behind the user pointer of a live mapping.
pub(crate) unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
  unsafe {
    let m = mapping_of(ptr);
    (*m).base as usize + (*m).len - ptr.as_ptr() as usize
  }
}
