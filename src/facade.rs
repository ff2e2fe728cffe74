//! Public entry points.
//!
//! The `try_*` functions report failures as [`Error`]; the raw functions
//! follow the C contract (null plus `errno`). Everything lazily bootstraps the
//! shared runtime on first use.

use core::{
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};
use std::sync::OnceLock;

use crate::{
  arena::Arena,
  config::Config,
  error::Error,
  heap::{Engine, HEAPS},
  oversize, platform,
  size_class::{MAX_LARGE_SIZE, SizeClassTable},
  stats::{self, Stats},
  superblock::{BLOCK_LIVE, BlockHeader, HEADER_SIZE, Superblock},
};

// =============================================================================
// Bootstrap
// =============================================================================

pub(crate) struct Runtime {
  config: Config,
  classes: SizeClassTable,
  arena: Arena,
}

static RUNTIME: OnceLock<Result<Runtime, Error>> = OnceLock::new();
static ANNOUNCED: AtomicBool = AtomicBool::new(false);

impl Runtime {
  /// The shared runtime. A failed bootstrap is remembered and reported to
  /// every later caller.
  #[inline]
  fn get() -> Result<&'static Runtime, Error> {
    if let Some(rt) = RUNTIME.get() {
      return rt.as_ref().map_err(|e| *e);
    }
    let rt = RUNTIME.get_or_init(Runtime::bootstrap).as_ref().map_err(|e| *e);

    // Announced outside the initializer: a logger may allocate.
    if !ANNOUNCED.swap(true, Ordering::Relaxed) {
      match rt {
        Ok(rt) => diag!(
          info,
          "rcmalloc ready: page_size={} cpus={} heaps={} classes={}",
          rt.config.page_size,
          rt.config.cpu_count,
          rt.config.heap_count(),
          rt.classes.len()
        ),
        Err(e) => diag!(warn, "rcmalloc bootstrap failed: {}", e),
      }
    }
    rt
  }

  fn bootstrap() -> Result<Runtime, Error> {
    let config = Config::detect();
    let classes = SizeClassTable::new(config.page_size)?;
    let arena = Arena::reserve(config.page_size)?;
    Ok(Runtime {
      config,
      classes,
      arena,
    })
  }

  #[inline]
  fn engine(&'static self) -> Engine<'static> {
    Engine {
      heaps: &HEAPS,
      arena: &self.arena,
      classes: &self.classes,
      config: &self.config,
    }
  }

  /// Class serving `size` user bytes, or `None` for a direct mapping.
  #[inline]
  fn class_for(&self, size: usize) -> Option<usize> {
    size.checked_add(HEADER_SIZE).and_then(|n| self.classes.class_of(n))
  }
}

/// Where a live user pointer came from.
enum Owner {
  Block(&'static Superblock),
  Mapped,
}

/// Resolves `ptr` to the live allocation it starts.
unsafe fn locate(rt: &'static Runtime, ptr: NonNull<u8>) -> Result<Owner, Error> {
  let addr = ptr.as_ptr() as usize;
  let invalid = Error::InvalidFree(addr);
  if addr % HEADER_SIZE != 0 || addr < HEADER_SIZE {
    return Err(invalid);
  }

  if rt.arena.contains(addr) {
    let block = unsafe { BlockHeader::from_user(ptr) };
    let sb = rt.engine().resolve(block.as_ptr() as usize).ok_or(invalid)?;
    let header = unsafe { &*block.as_ptr() };
    if header.magic != BLOCK_LIVE || header.class as usize != sb.class() {
      return Err(invalid);
    }
    return Ok(Owner::Block(sb));
  }

  if oversize::is_live(ptr) {
    Ok(Owner::Mapped)
  } else {
    Err(invalid)
  }
}

fn report_invalid(error: Error) {
  diag!(warn, "rcmalloc: {}", error);

  #[cfg(all(feature = "debug-tripwire", debug_assertions))]
  std::process::abort();
}

// =============================================================================
// Result API
// =============================================================================

/// Allocates at least `size` bytes aligned to 16.
pub fn try_malloc(size: usize) -> Result<NonNull<u8>, Error> {
  try_memalign(HEADER_SIZE, size)
}

/// Allocates at least `size` bytes aligned to `align`, which must be a power
/// of two. Alignments above 16 are served by a direct mapping.
pub fn try_memalign(align: usize, size: usize) -> Result<NonNull<u8>, Error> {
  let rt = Runtime::get()?;
  if align <= HEADER_SIZE
    && let Some(class) = rt.class_for(size)
  {
    let block = rt.engine().allocate(class)?;
    return Ok(BlockHeader::user_ptr(block));
  }
  oversize::map(size, align, rt.config.page_size)
}

/// Returns `ptr` to the allocator.
///
/// # Safety
///
/// `ptr` must not be used after this call. Pointers this allocator did not
/// hand out, and blocks already freed, are reported as
/// [`Error::InvalidFree`].
pub unsafe fn try_free(ptr: NonNull<u8>) -> Result<(), Error> {
  let rt = Runtime::get()?;
  let result = match unsafe { locate(rt, ptr) } {
    Ok(Owner::Block(_)) => unsafe { rt.engine().release(BlockHeader::from_user(ptr)) },
    Ok(Owner::Mapped) => unsafe { oversize::unmap(ptr) },
    Err(e) => Err(e),
  };
  if let Err(Error::InvalidFree(_)) = result {
    stats::COUNTERS.invalid_free();
  }
  result
}

/// Allocates `n * size` zeroed bytes. A product that overflows is
/// `OutOfMemory`.
pub fn try_calloc(n: usize, size: usize) -> Result<NonNull<u8>, Error> {
  let total = n.checked_mul(size).ok_or(Error::OutOfMemory)?;
  let ptr = try_malloc(total)?;
  // Direct mappings come zeroed from the OS.
  if total + HEADER_SIZE <= MAX_LARGE_SIZE {
    unsafe { ptr.as_ptr().write_bytes(0, total) };
  }
  Ok(ptr)
}

/// Resizes an allocation.
///
/// `None` behaves like [`try_malloc`]; a zero `size` frees the block and
/// yields `None`. Otherwise the contents up to the smaller of the old usable
/// size and `size` are preserved. The block stays where it is when the new
/// size lands in the same size class.
///
/// # Safety
///
/// On success the old pointer must no longer be used.
pub unsafe fn try_realloc(ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>, Error> {
  let Some(old) = ptr else {
    return try_malloc(size).map(Some);
  };
  if size == 0 {
    unsafe { try_free(old)? };
    return Ok(None);
  }

  let rt = Runtime::get()?;
  let owner = match unsafe { locate(rt, old) } {
    Ok(owner) => owner,
    Err(e) => {
      stats::COUNTERS.invalid_free();
      return Err(e);
    }
  };
  let old_usable = match owner {
    Owner::Block(sb) => {
      if rt.class_for(size) == Some(sb.class()) {
        return Ok(Some(old));
      }
      sb.usable_size()
    }
    Owner::Mapped => {
      let usable = unsafe { oversize::usable_size(old) };
      if rt.class_for(size).is_none() && size <= usable && size >= usable / 2 {
        return Ok(Some(old));
      }
      usable
    }
  };

  let new = try_malloc(size)?;
  unsafe {
    ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_usable.min(size));
    try_free(old)?;
  }
  Ok(Some(new))
}

/// Usable bytes of the allocation starting at `ptr`, 0 for null or foreign
/// pointers.
///
/// # Safety
///
/// `ptr` must not be concurrently freed. Foreign pointers yield 0.
pub unsafe fn usable_size(ptr: *const u8) -> usize {
  let Some(ptr) = NonNull::new(ptr.cast_mut()) else {
    return 0;
  };
  let Ok(rt) = Runtime::get() else {
    return 0;
  };
  match unsafe { locate(rt, ptr) } {
    Ok(Owner::Block(sb)) => sb.usable_size(),
    Ok(Owner::Mapped) => unsafe { oversize::usable_size(ptr) },
    Err(_) => 0,
  }
}

/// Snapshot of the allocator counters.
pub fn stats() -> Stats {
  let mut snapshot = stats::COUNTERS.snapshot();
  if let Some(Ok(rt)) = RUNTIME.get() {
    snapshot.arena_bytes = rt.arena.span_bytes();
    (snapshot.fast_allocs, snapshot.fast_frees) = rt.engine().fast_counts();
  }
  snapshot
}

/// Bootstrap values in effect, bootstrapping if needed.
pub fn config() -> Result<Config, Error> {
  Runtime::get().map(|rt| rt.config)
}

// =============================================================================
// Raw API
// =============================================================================

#[inline]
fn or_errno(result: Result<NonNull<u8>, Error>) -> *mut u8 {
  match result {
    Ok(ptr) => ptr.as_ptr(),
    Err(e) => {
      platform::set_errno(e.errno());
      null_mut()
    }
  }
}

/// `malloc(3)`: null and `ENOMEM` on failure.
pub fn malloc(size: usize) -> *mut u8 {
  or_errno(try_malloc(size))
}

/// Aligned allocation; null and `errno` on failure.
pub fn memalign(align: usize, size: usize) -> *mut u8 {
  if !align.is_power_of_two() {
    platform::set_errno(libc::EINVAL);
    return null_mut();
  }
  or_errno(try_memalign(align, size))
}

/// `free(3)`. Null is a no-op; invalid pointers are logged and ignored.
///
/// # Safety
///
/// See [`try_free`].
pub unsafe fn free(ptr: *mut u8) {
  let Some(ptr) = NonNull::new(ptr) else {
    return;
  };
  match unsafe { try_free(ptr) } {
    Ok(()) => {}
    Err(e @ Error::InvalidFree(_)) => report_invalid(e),
    Err(_) => {}
  }
}

/// `calloc(3)`.
pub fn calloc(n: usize, size: usize) -> *mut u8 {
  or_errno(try_calloc(n, size))
}

/// `realloc(3)`.
///
/// # Safety
///
/// See [`try_realloc`].
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  match unsafe { try_realloc(NonNull::new(ptr), size) } {
    Ok(Some(new)) => new.as_ptr(),
    Ok(None) => null_mut(),
    Err(e) => {
      if let Error::InvalidFree(_) = e {
        diag!(warn, "rcmalloc: realloc of {}", e);
      }
      platform::set_errno(e.errno());
      null_mut()
    }
  }
}
