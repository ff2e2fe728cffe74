#![allow(clippy::missing_safety_doc)]

//! Per-CPU superblock allocator.
//!
//! Every logical CPU owns a heap holding one superblock per size class.
//! Allocations and frees against that heap run as restartable critical
//! sections; only an exhausted heap (migration from the global heap) or a free
//! from a foreign CPU (remote free) takes a shared lock. Requests above
//! [`MAX_LARGE_SIZE`] are mapped directly.
//!
//! ```no_run
//! #[global_allocator]
//! static GLOBAL: rcmalloc::Allocator = rcmalloc::Allocator;
//! ```

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  ptr::{self, NonNull, null_mut},
};

// =============================================================================
// Diagnostics
// =============================================================================

thread_local! {
  static QUIET: Cell<bool> = const { Cell::new(false) };
}

/// Runs `emit` unless the calling thread is already inside a diagnostic,
/// which happens when the installed logger allocates through us.
pub(crate) fn quietly(emit: impl FnOnce()) {
  let entered = QUIET.try_with(|quiet| !quiet.replace(true)).unwrap_or(false);
  if !entered {
    return;
  }
  emit();
  let _ = QUIET.try_with(|quiet| quiet.set(false));
}

/// `log` macro wrapper. Never call it with a heap, bin or superblock lock held.
macro_rules! diag {
  ($level:ident, $($arg:tt)+) => {
    $crate::quietly(|| log::$level!($($arg)+))
  };
}

// =============================================================================
// Modules
// =============================================================================

mod arena;
mod config;
mod critical;
mod error;
mod facade;
mod heap;
mod oversize;
mod platform;
mod size_class;
mod stats;
mod superblock;
mod sync;

#[cfg(feature = "c_api")]
pub mod ffi;

pub use arena::ARENA_SIZE;
pub use config::{Config, MAX_CPUS, RECLAIM_AFTER_SCANS};
pub use critical::{cached_cpu, in_critical_section, notify_preemption, thread_restarts};
pub use error::Error;
pub use facade::{
  calloc, config, free, malloc, memalign, realloc, stats, try_calloc, try_free, try_malloc,
  try_memalign, try_realloc, usable_size,
};
pub use size_class::{MAX_CLASSES, MAX_LARGE_SIZE, OVERSIZE_CLASS, SizeClass, SizeClassTable};
pub use stats::Stats;
pub use superblock::HEADER_SIZE;

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    try_memalign(layout.align(), layout.size()).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { free(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= HEADER_SIZE {
      return match unsafe { try_realloc(NonNull::new(ptr), new_size) } {
        Ok(Some(new)) => new.as_ptr(),
        Ok(None) | Err(_) => null_mut(),
      };
    }

    // Over-aligned blocks are always direct mappings; move them by hand.
    let Ok(new) = try_memalign(layout.align(), new_size) else {
      return null_mut();
    };
    unsafe {
      ptr::copy_nonoverlapping(ptr, new.as_ptr(), layout.size().min(new_size));
      free(ptr);
    }
    new.as_ptr()
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let result = if layout.align() <= HEADER_SIZE {
      try_calloc(layout.size(), 1)
    } else {
      // Fresh mappings are zero-filled.
      try_memalign(layout.align(), layout.size())
    };
    result.map_or(null_mut(), NonNull::as_ptr)
  }
}
