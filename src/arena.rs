//! Monotonic arena backing every superblock.
//!
//! One `MAP_NORESERVE` region is reserved up front. Spans are carved upward
//! from the bottom and superblock headers downward from the top; neither
//! cursor ever moves back. A side table maps every arena page to the
//! superblock whose span covers it, so frees resolve their owner in O(1).

use core::{
  cell::UnsafeCell,
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::{error::Error, platform, superblock::Superblock, sync::SpinLock};

pub const ARENA_SIZE: usize = 1 << 30; // 1GB

/// Headers are carved at this alignment.
const META_ALIGN: usize = 64;

const _: () = assert!(ARENA_SIZE.is_power_of_two());

struct Cursors {
  /// Offset of the first byte not yet handed out as span memory.
  span_top: usize,
  /// Offset of the lowest byte handed out as header memory.
  meta_bottom: usize,
}

pub(crate) struct Arena {
  base: *mut u8,
  page_size: usize,
  /// One slot per arena page.
  page_map: *mut AtomicPtr<Superblock>,
  page_map_bytes: usize,
  grow: SpinLock,
  cursors: UnsafeCell<Cursors>,
  span_bytes: AtomicUsize,
}

unsafe impl Sync for Arena {}
unsafe impl Send for Arena {}

impl Arena {
  pub(crate) fn reserve(page_size: usize) -> Result<Self, Error> {
    if !page_size.is_power_of_two() || page_size > ARENA_SIZE {
      return Err(Error::InitializationFailure);
    }

    let base = unsafe { platform::os_mmap(ARENA_SIZE, true) };
    if base.is_null() {
      return Err(Error::InitializationFailure);
    }

    let entries = ARENA_SIZE / page_size;
    let page_map_bytes = align_up(entries * size_of::<AtomicPtr<Superblock>>(), page_size);
    let page_map = unsafe { platform::os_mmap(page_map_bytes, true) };
    if page_map.is_null() {
      unsafe { platform::os_munmap(base, ARENA_SIZE) };
      return Err(Error::InitializationFailure);
    }

    // Fresh anonymous pages are zeroed, which is a valid table of null slots.
    Ok(Self {
      base,
      page_size,
      page_map: page_map.cast(),
      page_map_bytes,
      grow: SpinLock::new(),
      cursors: UnsafeCell::new(Cursors {
        span_top: 0,
        meta_bottom: ARENA_SIZE,
      }),
      span_bytes: AtomicUsize::new(0),
    })
  }

  #[inline]
  pub(crate) fn page_size(&self) -> usize {
    self.page_size
  }

  #[inline]
  pub(crate) fn contains(&self, addr: usize) -> bool {
    let base = self.base as usize;
    addr >= base && addr < base + ARENA_SIZE
  }

  /// Bytes handed out as superblock spans so far.
  pub(crate) fn span_bytes(&self) -> usize {
    self.span_bytes.load(Ordering::Relaxed)
  }

  /// Hands out `span_bytes` of page-aligned span memory and `meta_bytes` of
  /// header memory. Fails with `OutOfMemory` once the two cursors would cross.
  pub(crate) fn carve(&self, span_bytes: usize, meta_bytes: usize) -> Result<(NonNull<u8>, NonNull<u8>), Error> {
    debug_assert!(span_bytes % self.page_size == 0);
    let meta_bytes = align_up(meta_bytes, META_ALIGN);

    let _g = self.grow.lock();
    let cursors = unsafe { &mut *self.cursors.get() };

    let span_end = cursors.span_top.checked_add(span_bytes).ok_or(Error::OutOfMemory)?;
    let meta_start = cursors.meta_bottom.checked_sub(meta_bytes).ok_or(Error::OutOfMemory)?;
    if span_end > meta_start {
      return Err(Error::OutOfMemory);
    }

    let span = unsafe { self.base.add(cursors.span_top) };
    let meta = unsafe { self.base.add(meta_start) };
    cursors.span_top = span_end;
    cursors.meta_bottom = meta_start;
    self.span_bytes.fetch_add(span_bytes, Ordering::Relaxed);

    // Both pointers are inside a successful mapping.
    Ok(unsafe { (NonNull::new_unchecked(span), NonNull::new_unchecked(meta)) })
  }

  /// Points every page of `[span, span + len)` at `owner`.
  pub(crate) fn register(&self, span: *mut u8, len: usize, owner: *mut Superblock) {
    let first = self.page_index(span as usize);
    for idx in first..first + len / self.page_size {
      unsafe { (*self.page_map.add(idx)).store(owner, Ordering::Release) };
    }
  }

  /// Superblock whose span covers `addr`, if any.
  #[inline]
  pub(crate) fn superblock_at(&self, addr: usize) -> Option<NonNull<Superblock>> {
    if !self.contains(addr) {
      return None;
    }
    let slot = unsafe { &*self.page_map.add(self.page_index(addr)) };
    NonNull::new(slot.load(Ordering::Acquire))
  }

  #[inline]
  fn page_index(&self, addr: usize) -> usize {
    (addr - self.base as usize) / self.page_size
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    unsafe {
      platform::os_munmap(self.page_map.cast(), self.page_map_bytes);
      platform::os_munmap(self.base, ARENA_SIZE);
    }
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
