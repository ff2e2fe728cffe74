//! Allocator-wide counters.
//!
//! Fast-path events are counted per CPU heap (see `heap`) and summed on
//! demand; everything else is rare enough for a shared atomic.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Point-in-time view of the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
  /// Span bytes carved from the arena.
  pub arena_bytes: usize,
  /// Superblocks ever created.
  pub superblocks: usize,
  /// Superblocks whose pages are currently handed back to the OS.
  pub released_superblocks: usize,
  /// Live direct mappings.
  pub oversize_mappings: usize,
  /// Bytes in live direct mappings.
  pub oversize_bytes: usize,
  pub fast_allocs: u64,
  pub fast_frees: u64,
  /// Slow-path refills of a CPU heap slot.
  pub refills: u64,
  /// Superblocks moved from the global heap into a CPU heap.
  pub migrations: u64,
  pub remote_frees: u64,
  /// Critical sections re-executed after a preemption notice.
  pub restarts: u64,
  pub invalid_frees: u64,
}

pub(crate) struct Counters {
  superblocks: AtomicUsize,
  released: AtomicUsize,
  oversize_mappings: AtomicUsize,
  oversize_bytes: AtomicUsize,
  refills: AtomicU64,
  migrations: AtomicU64,
  remote_frees: AtomicU64,
  restarts: AtomicU64,
  invalid_frees: AtomicU64,
}

pub(crate) static COUNTERS: Counters = Counters::new();

impl Counters {
  const fn new() -> Self {
    Self {
      superblocks: AtomicUsize::new(0),
      released: AtomicUsize::new(0),
      oversize_mappings: AtomicUsize::new(0),
      oversize_bytes: AtomicUsize::new(0),
      refills: AtomicU64::new(0),
      migrations: AtomicU64::new(0),
      remote_frees: AtomicU64::new(0),
      restarts: AtomicU64::new(0),
      invalid_frees: AtomicU64::new(0),
    }
  }

  pub(crate) fn superblock_created(&self) {
    self.superblocks.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn superblock_released(&self) {
    self.released.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn superblock_recommitted(&self) {
    self.released.fetch_sub(1, Ordering::Relaxed);
  }

  pub(crate) fn mapped(&self, bytes: usize) {
    self.oversize_mappings.fetch_add(1, Ordering::Relaxed);
    self.oversize_bytes.fetch_add(bytes, Ordering::Relaxed);
  }

  pub(crate) fn unmapped(&self, bytes: usize) {
    self.oversize_mappings.fetch_sub(1, Ordering::Relaxed);
    self.oversize_bytes.fetch_sub(bytes, Ordering::Relaxed);
  }

  pub(crate) fn refill(&self) {
    self.refills.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn migration(&self) {
    self.migrations.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn remote_free(&self) {
    self.remote_frees.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn restart(&self) {
    self.restarts.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn invalid_free(&self) {
    self.invalid_frees.fetch_add(1, Ordering::Relaxed);
  }

  /// Fills every field except the per-heap fast-path counts and the arena
  /// size, which the caller owns.
  pub(crate) fn snapshot(&self) -> Stats {
    Stats {
      superblocks: self.superblocks.load(Ordering::Relaxed),
      released_superblocks: self.released.load(Ordering::Relaxed),
      oversize_mappings: self.oversize_mappings.load(Ordering::Relaxed),
      oversize_bytes: self.oversize_bytes.load(Ordering::Relaxed),
      refills: self.refills.load(Ordering::Relaxed),
      migrations: self.migrations.load(Ordering::Relaxed),
      remote_frees: self.remote_frees.load(Ordering::Relaxed),
      restarts: self.restarts.load(Ordering::Relaxed),
      invalid_frees: self.invalid_frees.load(Ordering::Relaxed),
      ..Stats::default()
    }
  }
}
