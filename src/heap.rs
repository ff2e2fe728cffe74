//! Per-CPU heaps, the global heap, and the paths between them.
//!
//! Every CPU heap holds at most one superblock per size class. Allocation
//! pops from that superblock's local list inside a restartable section; when
//! it runs dry, `refill` swaps it for a superblock from the global heap (or a
//! fresh one) under the CPU lock and the class's global bin lock, which makes
//! select-and-install atomic with respect to other CPUs.
//!
//! Lock order: CPU heap -> global bin -> superblock -> arena.

use core::{
  cell::UnsafeCell,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

use crate::{
  arena::Arena,
  config::{Config, MAX_CPUS},
  critical::{self, Step},
  error::Error,
  size_class::{MAX_CLASSES, SizeClassTable},
  stats,
  superblock::{BLOCK_LIVE, BlockHeader, HEADER_SIZE, OWNER_GLOBAL, Parked, Superblock},
  sync::SpinLock,
};

// =============================================================================
// Heap storage
// =============================================================================

#[repr(C, align(128))]
pub(crate) struct CpuHeap {
  /// Held for the duration of a section or a refill on this heap.
  lock: SpinLock,
  bins: [AtomicPtr<Superblock>; MAX_CLASSES],
  fast_allocs: AtomicU64,
  fast_frees: AtomicU64,
}

impl CpuHeap {
  const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      bins: [const { AtomicPtr::new(null_mut()) }; MAX_CLASSES],
      fast_allocs: AtomicU64::new(0),
      fast_frees: AtomicU64::new(0),
    }
  }

  #[inline]
  fn installed(&self, class: usize) -> *mut Superblock {
    self.bins[class].load(Ordering::Acquire)
  }
}

/// Superblocks of one class not checked out by any CPU.
///
/// Superblocks that can serve a block sit on `available`; those with every
/// block live sit on `full` until a remote free wakes them, so a scan never
/// walks past them.
pub(crate) struct GlobalBin {
  lock: SpinLock,
  available: UnsafeCell<*mut Superblock>,
  full: UnsafeCell<*mut Superblock>,
  len: AtomicUsize,
}

unsafe impl Sync for GlobalBin {}
unsafe impl Send for GlobalBin {}

/// Most superblocks a scan inspects looking for a partially used one.
const SCAN_LIMIT: usize = 32;

/// Result of a scan over a global bin.
struct Selection {
  /// Superblock preceding the scan position (`None`: list head).
  prev: Option<NonNull<Superblock>>,
  found: Option<NonNull<Superblock>>,
  /// Idle superblocks whose pages were released during the scan.
  released: usize,
}

impl GlobalBin {
  const fn new() -> Self {
    Self {
      lock: SpinLock::new(),
      available: UnsafeCell::new(null_mut()),
      full: UnsafeCell::new(null_mut()),
      len: AtomicUsize::new(0),
    }
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  #[inline]
  fn head(&self, list: Parked) -> *mut *mut Superblock {
    match list {
      Parked::Full => self.full.get(),
      _ => self.available.get(),
    }
  }

  /// Picks a superblock that can serve blocks, preferring partially used
  /// ones so idle superblocks can age out. Looks at no more than
  /// `SCAN_LIMIT` entries. Caller holds `self.lock`.
  unsafe fn select(&self, reclaim_after: u32) -> Selection {
    let mut prev = None;
    let mut cur = unsafe { *self.available.get() };
    let mut idle: Option<(Option<NonNull<Superblock>>, NonNull<Superblock>)> = None;
    let mut released = 0;
    let mut scanned = 0;

    while let Some(sb) = NonNull::new(cur)
      && scanned < SCAN_LIMIT
    {
      scanned += 1;
      let s = unsafe { sb.as_ref() };
      if unsafe { s.is_available() } {
        if s.in_use() > 0 {
          if let Some((_, skipped)) = idle {
            released += unsafe { skipped.as_ref().age(reclaim_after) } as usize;
          }
          return Selection {
            prev,
            found: Some(sb),
            released,
          };
        }
        if idle.is_none() {
          idle = Some((prev, sb));
        } else {
          released += unsafe { s.age(reclaim_after) } as usize;
        }
      }
      prev = Some(sb);
      cur = unsafe { s.sibling() };
    }

    match idle {
      Some((idle_prev, sb)) => Selection {
        prev: idle_prev,
        found: Some(sb),
        released,
      },
      None => Selection {
        prev: None,
        found: None,
        released,
      },
    }
  }

  /// Links `sb` into `list` right after `prev` (`None`: at the head).
  /// Caller holds `self.lock`.
  unsafe fn link(&self, list: Parked, prev: Option<NonNull<Superblock>>, sb: NonNull<Superblock>) {
    unsafe {
      let s = sb.as_ref();
      let head = self.head(list);
      let next = match prev {
        None => *head,
        Some(p) => p.as_ref().sibling(),
      };
      s.set_sibling(next);
      s.set_prev_sibling(prev.map_or(null_mut(), NonNull::as_ptr));
      match prev {
        None => *head = sb.as_ptr(),
        Some(p) => p.as_ref().set_sibling(sb.as_ptr()),
      }
      if let Some(n) = next.as_ref() {
        n.set_prev_sibling(sb.as_ptr());
      }
      s.set_parked(list);
    }
    self.len.fetch_add(1, Ordering::Relaxed);
  }

  /// Caller holds `self.lock`; `sb` is on one of the lists.
  unsafe fn unlink(&self, sb: NonNull<Superblock>) {
    unsafe {
      let s = sb.as_ref();
      debug_assert_ne!(s.parked(), Parked::No);
      let prev = s.prev_sibling();
      let next = s.sibling();
      match prev.as_ref() {
        None => *self.head(s.parked()) = next,
        Some(p) => p.set_sibling(next),
      }
      if let Some(n) = next.as_ref() {
        n.set_prev_sibling(prev);
      }
      s.set_sibling(null_mut());
      s.set_prev_sibling(null_mut());
      s.set_parked(Parked::No);
    }
    self.len.fetch_sub(1, Ordering::Relaxed);
  }

  /// Parks an evicted superblock: after `prev` on the available list if it
  /// can serve a block, otherwise on the full list. Caller holds `self.lock`.
  unsafe fn park(&self, prev: Option<NonNull<Superblock>>, sb: NonNull<Superblock>) {
    unsafe {
      if sb.as_ref().is_available() {
        self.link(Parked::Available, prev, sb);
      } else {
        self.link(Parked::Full, None, sb);
      }
    }
  }

  /// Moves `sb` from the full list to the head of the available list once a
  /// remote free gave it a block. Caller holds `self.lock`.
  unsafe fn wake(&self, sb: NonNull<Superblock>) -> bool {
    unsafe {
      if sb.as_ref().parked() != Parked::Full || !sb.as_ref().is_available() {
        return false;
      }
      self.unlink(sb);
      self.link(Parked::Available, None, sb);
    }
    true
  }

  /// Every parked superblock, available list first.
  #[cfg(test)]
  fn members(&self) -> Vec<NonNull<Superblock>> {
    let mut out = Vec::new();
    for list in [Parked::Available, Parked::Full] {
      let mut cur = unsafe { *self.head(list) };
      while let Some(sb) = NonNull::new(cur) {
        assert_eq!(unsafe { sb.as_ref() }.parked(), list);
        out.push(sb);
        cur = unsafe { sb.as_ref().sibling() };
      }
    }
    out
  }

  #[cfg(test)]
  fn available_len(&self) -> usize {
    self
      .members()
      .iter()
      .filter(|sb| unsafe { sb.as_ref() }.parked() == Parked::Available)
      .count()
  }
}

pub(crate) struct Heaps {
  cpus: [CpuHeap; MAX_CPUS],
  global: [GlobalBin; MAX_CLASSES],
}

impl Heaps {
  pub(crate) const fn new() -> Self {
    Self {
      cpus: [const { CpuHeap::new() }; MAX_CPUS],
      global: [const { GlobalBin::new() }; MAX_CLASSES],
    }
  }
}

pub(crate) static HEAPS: Heaps = Heaps::new();

// =============================================================================
// Engine
// =============================================================================

/// What a refill did, reported once every lock is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refill {
  /// Another thread on this CPU refilled the slot first.
  Raced,
  /// Pending remote frees of the installed superblock were pulled in.
  Drained,
  /// A global superblock was installed.
  Migrated { heap: usize, released: usize },
  /// A new superblock was carved and installed.
  Created { heap: usize, released: usize },
}

/// Borrowed view of the bootstrap state that the allocation paths run on.
#[derive(Clone, Copy)]
pub(crate) struct Engine<'a> {
  pub(crate) heaps: &'a Heaps,
  pub(crate) arena: &'a Arena,
  pub(crate) classes: &'a SizeClassTable,
  pub(crate) config: &'a Config,
}

impl<'a> Engine<'a> {
  #[inline]
  fn cpu_heap(&self, cpu: usize) -> &'a CpuHeap {
    &self.heaps.cpus[self.config.heap_index(cpu)]
  }

  /// Hands out one block of `class`, migrating or creating superblocks as
  /// needed.
  pub(crate) fn allocate(&self, class: usize) -> Result<NonNull<BlockHeader>, Error> {
    debug_assert!(class > 0 && class < self.classes.bound());
    loop {
      if let Some(block) = self.fast_allocate(class) {
        return Ok(block);
      }

      let refill = self.refill(class)?;
      stats::COUNTERS.refill();
      match refill {
        Refill::Created { heap, released } => {
          diag!(debug, "created superblock class={} heap={} released={}", class, heap, released)
        }
        Refill::Migrated { heap, released } => {
          diag!(trace, "migrated superblock class={} heap={} released={}", class, heap, released)
        }
        Refill::Raced | Refill::Drained => {}
      }
    }
  }

  /// Pops the head of the current CPU's local list for `class`.
  #[inline]
  pub(crate) fn fast_allocate(&self, class: usize) -> Option<NonNull<BlockHeader>> {
    critical::run(|sec| {
      let heap = self.cpu_heap(sec.cpu());
      let _g = heap.lock.lock();

      let Some(sb) = (unsafe { heap.installed(class).as_ref() }) else {
        return Step::Abort;
      };
      let Some(block) = NonNull::new(unsafe { sb.local_head() }) else {
        return Step::Abort;
      };
      if sec.preempted() {
        return Step::Restart;
      }

      unsafe { sb.commit_pop(block) };
      heap.fast_allocs.fetch_add(1, Ordering::Relaxed);
      Step::Done(block)
    })
  }

  /// Makes sure the current CPU's slot for `class` has a local block.
  pub(crate) fn refill(&self, class: usize) -> Result<Refill, Error> {
    self.refill_on(self.config.heap_index(critical::refresh_cpu()), class)
  }

  /// Makes sure heap `index`'s slot for `class` has a local block.
  pub(crate) fn refill_on(&self, index: usize, class: usize) -> Result<Refill, Error> {
    let heap = &self.heaps.cpus[index];
    let _cpu = heap.lock.lock();

    let installed = heap.installed(class);
    if let Some(sb) = unsafe { installed.as_ref() } {
      if unsafe { sb.has_local() } {
        return Ok(Refill::Raced);
      }
      if unsafe { sb.merge_remote() } {
        return Ok(Refill::Drained);
      }
    }

    let bin = &self.heaps.global[class];
    let _bin = bin.lock.lock();
    let selection = unsafe { bin.select(self.config.reclaim_after_scans) };

    let (fresh, created) = match selection.found {
      Some(sb) => {
        unsafe { bin.unlink(sb) };
        debug_assert_eq!(unsafe { sb.as_ref() }.owner(), OWNER_GLOBAL);
        (sb, false)
      }
      None => (Superblock::create(self.arena, self.classes.class(class))?, true),
    };
    unsafe { fresh.as_ref().claim(index as u32) };

    // An evicted superblock that can still serve takes the scan position.
    if let Some(evicted) = NonNull::new(installed) {
      unsafe {
        evicted.as_ref().set_owner(OWNER_GLOBAL);
        bin.park(selection.prev, evicted);
      }
    }
    heap.bins[class].store(fresh.as_ptr(), Ordering::Release);

    if created {
      Ok(Refill::Created {
        heap: index,
        released: selection.released,
      })
    } else {
      stats::COUNTERS.migration();
      Ok(Refill::Migrated {
        heap: index,
        released: selection.released,
      })
    }
  }

  /// Superblock owning the block whose header sits at `addr`.
  #[inline]
  pub(crate) fn resolve(&self, addr: usize) -> Option<&'a Superblock> {
    let sb = unsafe { self.arena.superblock_at(addr)?.as_ref() };
    sb.holds_block(addr).then_some(sb)
  }

  /// Returns a live block to its superblock.
  pub(crate) unsafe fn release(&self, block: NonNull<BlockHeader>) -> Result<(), Error> {
    let addr = block.as_ptr() as usize;
    let invalid = Error::InvalidFree(addr + HEADER_SIZE);
    let sb = self.resolve(addr).ok_or(invalid)?;

    let header = unsafe { &*block.as_ptr() };
    if header.class as usize != sb.class() || header.magic != BLOCK_LIVE {
      return Err(invalid);
    }

    if !self.fast_free(sb, block) {
      unsafe { self.free_remote(sb, block) };
    }
    Ok(())
  }

  /// Pushes `block` onto the remote list of `sb`. A parked superblock that
  /// was full moves to the available list.
  unsafe fn free_remote(&self, sb: &Superblock, block: NonNull<BlockHeader>) {
    if unsafe { sb.push_remote(block) } {
      let bin = &self.heaps.global[sb.class()];
      let _bin = bin.lock.lock();
      unsafe { bin.wake(NonNull::from(sb)) };
    }
    stats::COUNTERS.remote_free();
  }

  /// Pushes `block` onto the local list if `sb` is the current CPU's slot.
  #[inline]
  fn fast_free(&self, sb: &Superblock, block: NonNull<BlockHeader>) -> bool {
    let target = sb as *const Superblock as *mut Superblock;
    critical::run(|sec| {
      let heap = self.cpu_heap(sec.cpu());
      let _g = heap.lock.lock();

      if heap.installed(sb.class()) != target {
        return Step::Abort;
      }
      if sec.preempted() {
        return Step::Restart;
      }

      unsafe { sb.push_local(block) };
      heap.fast_frees.fetch_add(1, Ordering::Relaxed);
      Step::Done(())
    })
    .is_some()
  }

  /// Sums the per-heap fast-path counters.
  pub(crate) fn fast_counts(&self) -> (u64, u64) {
    self.heaps.cpus[..self.config.heap_count()]
      .iter()
      .fold((0, 0), |(a, f), heap| {
        (
          a + heap.fast_allocs.load(Ordering::Relaxed),
          f + heap.fast_frees.load(Ordering::Relaxed),
        )
      })
  }

  #[cfg(test)]
  fn global_len(&self, class: usize) -> usize {
    self.heaps.global[class].len()
  }

  #[cfg(test)]
  fn installed(&self, heap: usize, class: usize) -> *mut Superblock {
    self.heaps.cpus[heap].installed(class)
  }

  /// Pops every local block of heap `index`'s slot for `class`.
  #[cfg(test)]
  fn drain_on(&self, index: usize, class: usize) -> Vec<NonNull<BlockHeader>> {
    let heap = &self.heaps.cpus[index];
    let _g = heap.lock.lock();
    let mut out = Vec::new();
    if let Some(sb) = unsafe { heap.installed(class).as_ref() } {
      while let Some(block) = NonNull::new(unsafe { sb.local_head() }) {
        unsafe { sb.commit_pop(block) };
        out.push(block);
      }
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{collections::HashSet, sync::Arc, thread};

  struct Fixture {
    heaps: Box<Heaps>,
    arena: Arena,
    classes: SizeClassTable,
    config: Config,
  }

  impl Fixture {
    fn new(cpu_count: usize) -> Self {
      Self {
        heaps: Box::new(Heaps::new()),
        arena: Arena::reserve(4096).unwrap(),
        classes: SizeClassTable::new(4096).unwrap(),
        config: Config {
          page_size: 4096,
          cpu_count,
          reclaim_after_scans: 2,
        },
      }
    }

    fn engine(&self) -> Engine<'_> {
      Engine {
        heaps: &self.heaps,
        arena: &self.arena,
        classes: &self.classes,
        config: &self.config,
      }
    }
  }

  // A single heap makes every thread share one CPU slot, so the tests do not
  // depend on the scheduler.
  fn single() -> Fixture {
    Fixture::new(1)
  }

  #[test]
  fn first_allocation_creates_a_superblock() {
    let fx = single();
    let e = fx.engine();
    let class = fx.classes.class_of(64).unwrap();

    assert!(e.fast_allocate(class).is_none());
    let block = e.allocate(class).unwrap();
    let sb = e.resolve(block.as_ptr() as usize).unwrap();
    assert_eq!(sb.owner(), 0);
    assert_eq!(sb.in_use(), 1);
    assert_eq!(e.installed(0, class), sb as *const _ as *mut _);
  }

  #[test]
  fn blocks_are_distinct_and_tagged() {
    let fx = single();
    let e = fx.engine();
    let class = fx.classes.class_of(100).unwrap();
    let mut seen = HashSet::new();

    for _ in 0..500 {
      let block = e.allocate(class).unwrap();
      assert!(seen.insert(block.as_ptr() as usize));
      let header = unsafe { &*block.as_ptr() };
      assert_eq!(header.class as usize, class);
      assert_eq!(header.magic, BLOCK_LIVE);
    }
  }

  #[test]
  fn local_free_feeds_the_next_allocation() {
    let fx = single();
    let e = fx.engine();
    let class = fx.classes.class_of(32).unwrap();

    let a = e.allocate(class).unwrap();
    unsafe { e.release(a).unwrap() };
    let b = e.allocate(class).unwrap();
    assert_eq!(a, b);
    assert_eq!(e.fast_counts().1, 1);
  }

  #[test]
  fn exhausted_superblock_is_evicted_to_global() {
    let fx = single();
    let e = fx.engine();
    let class = fx.classes.class_of(2000).unwrap();
    let per_span = fx.classes.class(class).blocks;

    let first: Vec<_> = (0..per_span).map(|_| e.allocate(class).unwrap()).collect();
    let first_sb = e.installed(0, class);
    assert_eq!(e.global_len(class), 0);

    let next = e.allocate(class).unwrap();
    assert_ne!(e.installed(0, class), first_sb);
    assert_eq!(e.global_len(class), 1);
    assert_eq!(unsafe { &*first_sb }.owner(), OWNER_GLOBAL);

    // Frees into the parked superblock go to its remote list.
    unsafe {
      for b in &first {
        e.release(*b).unwrap();
      }
      e.release(next).unwrap();
      assert!((*first_sb).has_remote());
      assert_eq!((*first_sb).in_use(), 0);
    }
  }

  #[test]
  fn global_superblock_is_migrated_back() {
    let fx = single();
    let e = fx.engine();
    let class = fx.classes.class_of(3000).unwrap();
    let per_span = fx.classes.class(class).blocks;

    let first: Vec<_> = (0..per_span).map(|_| e.allocate(class).unwrap()).collect();
    let first_sb = e.installed(0, class);
    let second: Vec<_> = (0..per_span).map(|_| e.allocate(class).unwrap()).collect();
    unsafe {
      for b in &first {
        e.release(*b).unwrap();
      }
    }

    // The second superblock is exhausted; its slot must be refilled with the
    // first one rather than a new superblock.
    let created_before = fx.arena.span_bytes();
    let again = e.allocate(class).unwrap();
    assert_eq!(fx.arena.span_bytes(), created_before);
    assert_eq!(e.installed(0, class), first_sb);
    assert_eq!(e.resolve(again.as_ptr() as usize).unwrap() as *const _ as *mut _, first_sb);
    drop(second);
  }

  #[test]
  fn installed_superblock_drains_its_own_remote_list() {
    let fx = single();
    let e = fx.engine();
    let class = fx.classes.class_of(4000).unwrap();
    let per_span = fx.classes.class(class).blocks;

    let blocks: Vec<_> = (0..per_span).map(|_| e.allocate(class).unwrap()).collect();
    let sb = unsafe { &*e.installed(0, class) };
    // Simulate frees issued from another CPU.
    for b in &blocks {
      unsafe { sb.push_remote(*b) };
    }
    assert_eq!(e.refill(class).unwrap(), Refill::Drained);
    assert_eq!(e.installed(0, class), sb as *const _ as *mut _);
    assert!(e.fast_allocate(class).is_some());
  }

  #[test]
  fn release_rejects_foreign_and_double_frees() {
    let fx = single();
    let e = fx.engine();
    let class = fx.classes.class_of(64).unwrap();
    let block = e.allocate(class).unwrap();

    unsafe {
      e.release(block).unwrap();
      assert!(matches!(e.release(block), Err(Error::InvalidFree(_))));

      let mut local = BlockHeader {
        next: null_mut(),
        class: class as u8,
        magic: BLOCK_LIVE,
      };
      let foreign = NonNull::from(&mut local);
      assert!(matches!(e.release(foreign), Err(Error::InvalidFree(_))));

      let interior = NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(8).cast::<BlockHeader>());
      assert!(matches!(e.release(interior), Err(Error::InvalidFree(_))));
    }
  }

  #[test]
  fn select_prefers_partially_used_superblocks() {
    let fx = single();
    let e = fx.engine();
    let class = fx.classes.class_of(1500).unwrap();
    let per_span = fx.classes.class(class).blocks;

    // Three superblocks: A fully freed, B half freed, C installed.
    let a: Vec<_> = (0..per_span).map(|_| e.allocate(class).unwrap()).collect();
    let sb_a = e.installed(0, class);
    let b: Vec<_> = (0..per_span).map(|_| e.allocate(class).unwrap()).collect();
    let sb_b = e.installed(0, class);
    let c: Vec<_> = (0..per_span).map(|_| e.allocate(class).unwrap()).collect();
    unsafe {
      for blk in &a {
        e.release(*blk).unwrap();
      }
      e.release(b[0]).unwrap();
    }

    let _next = e.allocate(class).unwrap();
    assert_eq!(e.installed(0, class), sb_b);
    assert_eq!(unsafe { &*sb_a }.owner(), OWNER_GLOBAL);
    drop(c);
  }

  fn bin_of(sbs: &[NonNull<Superblock>]) -> GlobalBin {
    let bin = GlobalBin::new();
    let mut prev = None;
    for sb in sbs {
      unsafe { bin.park(prev, *sb) };
      prev = Some(*sb);
    }
    bin
  }

  #[test]
  fn select_falls_back_to_first_idle_then_to_tail() {
    let arena = Arena::reserve(4096).unwrap();
    let table = SizeClassTable::new(4096).unwrap();
    let class = table.class(table.class_of(512).unwrap());
    let idle_a = Superblock::create(&arena, class).unwrap();
    let idle_b = Superblock::create(&arena, class).unwrap();

    let bin = bin_of(&[idle_a, idle_b]);
    let _g = bin.lock.lock();
    let sel = unsafe { bin.select(RECLAIM_NEVER) };
    assert_eq!(sel.found, Some(idle_a));
    assert_eq!(sel.prev, None);

    let empty = GlobalBin::new();
    let sel = unsafe { empty.select(RECLAIM_NEVER) };
    assert!(sel.found.is_none() && sel.prev.is_none());
    assert_eq!(bin.len(), 2);
  }

  const RECLAIM_NEVER: u32 = u32::MAX;

  #[cfg(feature = "release-mem")]
  #[test]
  fn skipped_idle_superblocks_release_pages() {
    let arena = Arena::reserve(4096).unwrap();
    let table = SizeClassTable::new(4096).unwrap();
    let class = table.class(table.class_of(512).unwrap());
    let idle_a = Superblock::create(&arena, class).unwrap();
    let idle_b = Superblock::create(&arena, class).unwrap();
    let partial = Superblock::create(&arena, class).unwrap();
    unsafe {
      let p = partial.as_ref();
      p.commit_pop(NonNull::new(p.local_head()).unwrap());
    }

    let bin = bin_of(&[idle_a, idle_b, partial]);
    let _g = bin.lock.lock();

    let first = unsafe { bin.select(2) };
    assert_eq!(first.found, Some(partial));
    assert_eq!(first.prev, Some(idle_b));
    assert_eq!(first.released, 0);

    let second = unsafe { bin.select(2) };
    assert_eq!(second.found, Some(partial));
    assert_eq!(second.released, 2);
    unsafe {
      assert!(idle_a.as_ref().is_released());
      assert!(idle_b.as_ref().is_released());
      // Released superblocks stay claimable and come back with every block.
      idle_a.as_ref().claim(0);
      assert!(idle_a.as_ref().has_local());
    }
    assert!(!unsafe { partial.as_ref() }.is_released());
  }

  #[test]
  fn threads_sharing_a_heap_never_hand_out_the_same_block() {
    let fx = Arc::new(single());
    let class = fx.classes.class_of(48).unwrap();

    let handles: Vec<_> = (0..4)
      .map(|_| {
        let fx = Arc::clone(&fx);
        thread::spawn(move || {
          let e = fx.engine();
          let mut mine = Vec::new();
          for i in 0..2000 {
            mine.push(e.allocate(class).unwrap().as_ptr() as usize);
            if i % 3 == 0 {
              let addr = mine.swap_remove(0);
              unsafe { e.release(NonNull::new_unchecked(addr as *mut BlockHeader)).unwrap() };
            }
          }
          mine
        })
      })
      .collect();

    let mut all = HashSet::new();
    for h in handles {
      for addr in h.join().unwrap() {
        assert!(all.insert(addr), "block {addr:#x} handed out twice");
      }
    }
  }

  #[test]
  fn cross_heap_frees_go_remote() {
    let fx = Arc::new(Fixture::new(MAX_CPUS));
    let class = fx.classes.class_of(80).unwrap();

    let blocks: Vec<usize> = (0..64)
      .map(|_| fx.engine().allocate(class).unwrap().as_ptr() as usize)
      .collect();
    let remote_before = stats::COUNTERS.snapshot().remote_frees;

    let fx2 = Arc::clone(&fx);
    thread::spawn(move || {
      let e = fx2.engine();
      for addr in blocks {
        unsafe { e.release(NonNull::new_unchecked(addr as *mut BlockHeader)).unwrap() };
      }
    })
    .join()
    .unwrap();

    // Whether each free was local or remote depends on scheduling; every
    // block must have been accepted either way.
    let (_, fast_frees) = fx.engine().fast_counts();
    let remote = stats::COUNTERS.snapshot().remote_frees - remote_before;
    assert!(fast_frees + remote >= 64);
  }

  #[test]
  fn full_superblocks_stay_off_the_scanned_list() {
    let fx = single();
    let e = fx.engine();
    let class = fx.classes.class_of(2500).unwrap();
    let per_span = fx.classes.class(class).blocks;

    let mut spans = Vec::new();
    for _ in 0..SCAN_LIMIT + 8 {
      let blocks: Vec<_> = (0..per_span).map(|_| e.allocate(class).unwrap()).collect();
      spans.push((e.installed(0, class), blocks));
    }
    let bin = &fx.heaps.global[class];
    assert_eq!(bin.len(), SCAN_LIMIT + 7);
    assert_eq!(bin.available_len(), 0);

    // A free into the oldest parked superblock wakes it.
    let (oldest, blocks) = &spans[0];
    unsafe { e.release(blocks[0]).unwrap() };
    assert_eq!(bin.available_len(), 1);
    assert_eq!(unsafe { &**oldest }.parked(), Parked::Available);

    // The next refill finds it at once instead of carving a new span.
    let carved = fx.arena.span_bytes();
    let again = e.allocate(class).unwrap();
    assert_eq!(fx.arena.span_bytes(), carved);
    assert_eq!(again, blocks[0]);
    assert_eq!(e.installed(0, class), *oldest);
    assert_eq!(unsafe { &**oldest }.parked(), Parked::No);
    assert_eq!(bin.len(), SCAN_LIMIT + 7);
  }

  #[test]
  fn select_gives_up_after_the_scan_limit() {
    let arena = Arena::reserve(4096).unwrap();
    let table = SizeClassTable::new(4096).unwrap();
    let class = table.class(table.class_of(512).unwrap());
    let mut sbs: Vec<_> = (0..SCAN_LIMIT + 2)
      .map(|_| Superblock::create(&arena, class).unwrap())
      .collect();
    let partial = Superblock::create(&arena, class).unwrap();
    unsafe {
      let p = partial.as_ref();
      p.commit_pop(NonNull::new(p.local_head()).unwrap());
    }
    sbs.push(partial);

    let bin = bin_of(&sbs);
    let _g = bin.lock.lock();
    let sel = unsafe { bin.select(RECLAIM_NEVER) };
    assert_eq!(sel.found, Some(sbs[0]));
    assert_eq!(sel.prev, None);
  }

  #[test]
  fn unlink_keeps_both_lists_consistent() {
    let arena = Arena::reserve(4096).unwrap();
    let table = SizeClassTable::new(4096).unwrap();
    let class = table.class(table.class_of(512).unwrap());
    let sbs: Vec<_> = (0..3).map(|_| Superblock::create(&arena, class).unwrap()).collect();
    let bin = bin_of(&sbs);

    unsafe {
      bin.unlink(sbs[1]);
      assert_eq!(bin.members(), vec![sbs[0], sbs[2]]);
      assert_eq!(sbs[2].as_ref().prev_sibling(), sbs[0].as_ptr());
      bin.unlink(sbs[0]);
      assert_eq!(sbs[2].as_ref().prev_sibling(), null_mut());
      bin.unlink(sbs[2]);
    }
    assert!(bin.members().is_empty());
    assert_eq!(bin.len(), 0);
  }

  #[test]
  fn heaps_racing_for_one_bin_never_share_a_superblock() {
    const HEAPS_USED: usize = 8;
    const ROUNDS: usize = 300;

    let fx = Arc::new(Fixture::new(HEAPS_USED));
    let class = fx.classes.class_of(1024).unwrap();
    {
      let bin = &fx.heaps.global[class];
      let _g = bin.lock.lock();
      for _ in 0..4 {
        let sb = Superblock::create(&fx.arena, fx.classes.class(class)).unwrap();
        unsafe { bin.park(None, sb) };
      }
    }

    let handles: Vec<_> = (0..HEAPS_USED)
      .map(|index| {
        let fx = Arc::clone(&fx);
        thread::spawn(move || {
          let e = fx.engine();
          let mut previous: Vec<NonNull<BlockHeader>> = Vec::new();
          for _ in 0..ROUNDS {
            e.refill_on(index, class).unwrap();
            let sb = unsafe { &*e.installed(index, class) };
            assert_eq!(sb.owner(), index as u32);
            assert_eq!(sb.parked(), Parked::No);

            let drained = e.drain_on(index, class);
            assert!(!drained.is_empty());
            for block in previous.drain(..) {
              unsafe { e.release(block).unwrap() };
            }
            previous = drained;
          }
          previous.len()
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }

    let e = fx.engine();
    let bin = &fx.heaps.global[class];
    let _g = bin.lock.lock();
    let members = bin.members();
    assert_eq!(members.len(), bin.len());

    let mut seen = HashSet::new();
    for index in 0..HEAPS_USED {
      let sb = e.installed(index, class);
      assert!(seen.insert(sb as usize), "superblock installed twice");
      assert_eq!(unsafe { &*sb }.owner(), index as u32);
    }
    for sb in members {
      assert!(seen.insert(sb.as_ptr() as usize), "superblock both parked and installed");
      assert_eq!(unsafe { sb.as_ref() }.owner(), OWNER_GLOBAL);
    }
  }
}
