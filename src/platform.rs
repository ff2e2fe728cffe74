//! Thin wrappers over the OS: page mapping, CPU id, sysconf queries, errno.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicU32, Ordering};

/// Used when `sysconf(_SC_PAGESIZE)` fails.
pub const FALLBACK_PAGE_SIZE: usize = 4096;
/// Used when `sysconf(_SC_NPROCESSORS_CONF)` fails.
pub const FALLBACK_CPU_COUNT: usize = 64;

pub(crate) unsafe fn os_mmap(size: usize, noreserve: bool) -> *mut u8 {
  let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
  if noreserve {
    flags |= libc::MAP_NORESERVE;
  }
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      flags,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

pub(crate) unsafe fn os_munmap(ptr: *mut u8, size: usize) -> bool {
  unsafe { libc::munmap(ptr.cast(), size) == 0 }
}

/// Drops the physical pages behind `[ptr, ptr + size)`. The range stays mapped
/// and reads back as zeroes.
#[cfg(feature = "release-mem")]
pub(crate) unsafe fn os_release(ptr: *mut u8, size: usize) -> bool {
  unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) == 0 }
}

pub(crate) fn page_size() -> usize {
  let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if raw <= 0 || !(raw as usize).is_power_of_two() {
    FALLBACK_PAGE_SIZE
  } else {
    raw as usize
  }
}

pub(crate) fn cpu_count() -> usize {
  let raw = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
  if raw <= 0 {
    FALLBACK_CPU_COUNT
  } else {
    raw as usize
  }
}

// Each thread gets a different ID
#[cfg_attr(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"), allow(dead_code))]
fn thread_id_u32() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(0);
      CTR.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  TID.with(|&id| id)
}

// Only supported in the latest x86 CPUs. Seems to be the fastest way to access CPU ID
#[cfg(all(target_arch = "x86_64", target_os = "linux", feature = "rdpid"))]
pub(crate) fn cpu_id() -> usize {
  let cpu: u64;
  unsafe {
    std::arch::asm!("rdpid {}", out(reg) cpu, options(nomem, nostack, preserves_flags));
  }
  (cpu & 0xFFF) as usize
}

#[cfg(all(target_os = "linux", not(all(target_arch = "x86_64", feature = "rdpid"))))]
pub(crate) fn cpu_id() -> usize {
  let cpu = unsafe { libc::sched_getcpu() };
  if cpu < 0 {
    thread_id_u32() as usize
  } else {
    cpu as usize
  }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn cpu_id() -> usize {
  thread_id_u32() as usize
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn set_errno(value: i32) {
  unsafe { *libc::__errno_location() = value };
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) fn set_errno(value: i32) {
  unsafe { *libc::__error() = value };
}

#[cfg(not(any(
  target_os = "linux",
  target_os = "android",
  target_os = "macos",
  target_os = "ios",
  target_os = "freebsd"
)))]
pub(crate) fn set_errno(_value: i32) {}
