//! Superblocks: page spans pre-split into equal blocks of one size class.
//!
//! A superblock keeps two free lists. The local list belongs to whichever heap
//! currently holds the superblock and is only touched under that heap's
//! protection (the owning CPU's section, or the global bin lock). The remote
//! list collects frees from every other CPU and is guarded by the
//! superblock's own lock.

use core::{
  cell::UnsafeCell,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU32, Ordering},
};

use crate::{arena::Arena, error::Error, size_class::SizeClass, stats, sync::SpinLock};

/// Bytes in front of every allocation.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Header state of a block sitting on a free list.
pub(crate) const BLOCK_FREE: u32 = 0xF4EE_B10C;
/// Header state of a block handed to a caller.
pub(crate) const BLOCK_LIVE: u32 = 0x11FE_B10C;
/// Header state of a directly mapped block.
pub(crate) const BLOCK_MAPPED: u32 = 0x4A99_ED00;

/// Owner id of a superblock parked in the global heap.
pub(crate) const OWNER_GLOBAL: u32 = u32::MAX;

/// Which global bin list a superblock is linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Parked {
  No = 0,
  /// Can hand out a block once claimed.
  Available = 1,
  /// Every block is live.
  Full = 2,
}

const _: () = assert!(HEADER_SIZE == 16);

#[repr(C, align(16))]
pub(crate) struct BlockHeader {
  /// Free-list link, meaningless while the block is live.
  pub(crate) next: *mut BlockHeader,
  pub(crate) class: u8,
  pub(crate) magic: u32,
}

impl BlockHeader {
  /// Header of the allocation starting at `ptr`.
  #[inline]
  pub(crate) unsafe fn from_user(ptr: NonNull<u8>) -> NonNull<BlockHeader> {
    unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE).cast()) }
  }

  #[inline]
  pub(crate) fn user_ptr(block: NonNull<BlockHeader>) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
  }
}

#[repr(C, align(64))]
pub(crate) struct Superblock {
  class: usize,
  block_size: usize,
  blocks: usize,
  span: *mut u8,
  span_len: usize,

  // === Owner side ===
  local_head: UnsafeCell<*mut BlockHeader>,
  /// Blocks currently handed out.
  in_use: AtomicU32,
  /// CPU heap index holding this superblock, or `OWNER_GLOBAL`.
  owner: AtomicU32,
  /// Global bin links and list membership. Guarded by the bin lock.
  sibling: UnsafeCell<*mut Superblock>,
  prev_sibling: UnsafeCell<*mut Superblock>,
  parked: AtomicU8,
  /// Consecutive global scans that skipped this superblock while idle.
  idle_scans: AtomicU32,
  /// Pages were handed back to the OS; the free lists need rebuilding.
  released: AtomicBool,

  // === Cross-CPU side ===
  lock: SpinLock,
  /// Written under `lock`; peeked without it.
  remote_head: AtomicPtr<BlockHeader>,
}

unsafe impl Sync for Superblock {}
unsafe impl Send for Superblock {}

impl Superblock {
  /// Carves a superblock for `class` out of the arena and threads all of its
  /// blocks onto the local list.
  pub(crate) fn create(arena: &Arena, class: &SizeClass) -> Result<NonNull<Superblock>, Error> {
    let span_len = class.pages * arena.page_size();
    let (span, meta) = arena.carve(span_len, size_of::<Superblock>())?;
    let sb = meta.cast::<Superblock>();

    unsafe {
      ptr::write(
        sb.as_ptr(),
        Superblock {
          class: class.id as usize,
          block_size: class.size,
          blocks: class.blocks,
          span: span.as_ptr(),
          span_len,
          local_head: UnsafeCell::new(null_mut()),
          in_use: AtomicU32::new(0),
          owner: AtomicU32::new(OWNER_GLOBAL),
          sibling: UnsafeCell::new(null_mut()),
          prev_sibling: UnsafeCell::new(null_mut()),
          parked: AtomicU8::new(Parked::No as u8),
          idle_scans: AtomicU32::new(0),
          released: AtomicBool::new(false),
          lock: SpinLock::new(),
          remote_head: AtomicPtr::new(null_mut()),
        },
      );
      let head = sb.as_ref().thread_blocks();
      *sb.as_ref().local_head.get() = head;
    }

    arena.register(span.as_ptr(), span_len, sb.as_ptr());
    stats::COUNTERS.superblock_created();
    Ok(sb)
  }

  /// Writes a fresh header into every slot, chained in address order.
  fn thread_blocks(&self) -> *mut BlockHeader {
    let mut next: *mut BlockHeader = null_mut();
    for i in (0..self.blocks).rev() {
      let block = unsafe { self.span.add(i * self.block_size) }.cast::<BlockHeader>();
      unsafe {
        ptr::write(
          block,
          BlockHeader {
            next,
            class: self.class as u8,
            magic: BLOCK_FREE,
          },
        );
      }
      next = block;
    }
    next
  }

  #[inline]
  pub(crate) fn class(&self) -> usize {
    self.class
  }

  #[inline]
  pub(crate) fn usable_size(&self) -> usize {
    self.block_size - HEADER_SIZE
  }

  #[inline]
  pub(crate) fn in_use(&self) -> u32 {
    self.in_use.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn owner(&self) -> u32 {
    self.owner.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn set_owner(&self, owner: u32) {
    self.owner.store(owner, Ordering::Release);
  }

  #[inline]
  pub(crate) fn is_released(&self) -> bool {
    self.released.load(Ordering::Acquire)
  }

  /// Whether `addr` is the header address of one of this superblock's blocks.
  #[inline]
  pub(crate) fn holds_block(&self, addr: usize) -> bool {
    let base = self.span as usize;
    addr >= base
      && addr < base + self.blocks * self.block_size
      && (addr - base) % self.block_size == 0
  }

  // === Local list: caller holds the owning heap's protection ===

  #[inline]
  pub(crate) unsafe fn local_head(&self) -> *mut BlockHeader {
    unsafe { *self.local_head.get() }
  }

  #[inline]
  pub(crate) unsafe fn has_local(&self) -> bool {
    unsafe { !self.local_head().is_null() }
  }

  /// Unlinks `block`, which must be the current local head, and hands it out.
  #[inline]
  pub(crate) unsafe fn commit_pop(&self, block: NonNull<BlockHeader>) {
    unsafe {
      debug_assert_eq!(self.local_head(), block.as_ptr());
      *self.local_head.get() = (*block.as_ptr()).next;
      (*block.as_ptr()).magic = BLOCK_LIVE;
    }
    self.in_use.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) unsafe fn push_local(&self, block: NonNull<BlockHeader>) {
    unsafe {
      let b = block.as_ptr();
      (*b).magic = BLOCK_FREE;
      (*b).next = self.local_head();
      *self.local_head.get() = b;
    }
    let prev = self.in_use.fetch_sub(1, Ordering::Release);
    debug_assert!(prev != 0, "push_local: in_use underflow");
  }

  /// Pulls every pending remote free onto the local list. Returns whether
  /// anything moved.
  pub(crate) unsafe fn merge_remote(&self) -> bool {
    if self.remote_head.load(Ordering::Acquire).is_null() {
      return false;
    }

    let _g = self.lock.lock();
    let remote = self.remote_head.swap(null_mut(), Ordering::Acquire);
    if remote.is_null() {
      return false;
    }

    unsafe {
      let local = self.local_head();
      if local.is_null() {
        *self.local_head.get() = remote;
      } else {
        let mut tail = local;
        while !(*tail).next.is_null() {
          tail = (*tail).next;
        }
        (*tail).next = remote;
      }
    }
    true
  }

  /// Prepares a superblock taken from the global heap for its new owner.
  pub(crate) unsafe fn claim(&self, owner: u32) {
    if self.is_released() {
      let _g = self.lock.lock();
      let head = self.thread_blocks();
      unsafe { *self.local_head.get() = head };
      self.remote_head.store(null_mut(), Ordering::Relaxed);
      self.released.store(false, Ordering::Release);
      stats::COUNTERS.superblock_recommitted();
    } else {
      unsafe { self.merge_remote() };
    }
    self.idle_scans.store(0, Ordering::Relaxed);
    self.set_owner(owner);
  }

  // === Remote list ===

  #[inline]
  pub(crate) fn has_remote(&self) -> bool {
    !self.remote_head.load(Ordering::Acquire).is_null()
  }

  /// Returns whether the superblock was full before this free, i.e. it just
  /// became available again.
  pub(crate) unsafe fn push_remote(&self, block: NonNull<BlockHeader>) -> bool {
    let _g = self.lock.lock();
    unsafe {
      let b = block.as_ptr();
      (*b).magic = BLOCK_FREE;
      (*b).next = self.remote_head.load(Ordering::Relaxed);
    }
    self.remote_head.store(block.as_ptr(), Ordering::Release);
    let prev = self.in_use.fetch_sub(1, Ordering::Release);
    debug_assert!(prev != 0, "push_remote: in_use underflow");
    prev as usize == self.blocks
  }

  // === Global bin: caller holds the bin lock ===

  #[inline]
  pub(crate) unsafe fn sibling(&self) -> *mut Superblock {
    unsafe { *self.sibling.get() }
  }

  #[inline]
  pub(crate) unsafe fn set_sibling(&self, next: *mut Superblock) {
    unsafe { *self.sibling.get() = next };
  }

  #[inline]
  pub(crate) unsafe fn prev_sibling(&self) -> *mut Superblock {
    unsafe { *self.prev_sibling.get() }
  }

  #[inline]
  pub(crate) unsafe fn set_prev_sibling(&self, prev: *mut Superblock) {
    unsafe { *self.prev_sibling.get() = prev };
  }

  #[inline]
  pub(crate) fn parked(&self) -> Parked {
    match self.parked.load(Ordering::Relaxed) {
      1 => Parked::Available,
      2 => Parked::Full,
      _ => Parked::No,
    }
  }

  #[inline]
  pub(crate) unsafe fn set_parked(&self, parked: Parked) {
    self.parked.store(parked as u8, Ordering::Relaxed);
  }

  /// Can hand out at least one block once claimed.
  #[inline]
  pub(crate) unsafe fn is_available(&self) -> bool {
    (unsafe { self.has_local() }) || self.has_remote() || self.is_released()
  }

  /// Records that a scan passed over this idle superblock. Once it has been
  /// skipped `threshold` times in a row its pages go back to the OS. Returns
  /// whether that happened now.
  pub(crate) unsafe fn age(&self, threshold: u32) -> bool {
    if self.is_released() || self.in_use() != 0 {
      self.idle_scans.store(0, Ordering::Relaxed);
      return false;
    }
    let scans = self.idle_scans.fetch_add(1, Ordering::Relaxed) + 1;
    if scans < threshold {
      return false;
    }
    unsafe { self.release_pages() }
  }

  #[cfg(feature = "release-mem")]
  unsafe fn release_pages(&self) -> bool {
    let _g = self.lock.lock();
    // Re-check under the lock: a stray remote free may have raced in.
    if self.in_use.load(Ordering::Acquire) != 0 {
      return false;
    }
    if !unsafe { crate::platform::os_release(self.span, self.span_len) } {
      return false;
    }
    unsafe { *self.local_head.get() = null_mut() };
    self.remote_head.store(null_mut(), Ordering::Relaxed);
    self.released.store(true, Ordering::Release);
    stats::COUNTERS.superblock_released();
    true
  }

  #[cfg(not(feature = "release-mem"))]
  unsafe fn release_pages(&self) -> bool {
    false
  }
}
