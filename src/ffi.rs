//! C ABI exports (enabled with `--features c_api`).
//!
//! Linking the cdylib or staticlib with this feature replaces the libc
//! allocator for the whole process.

use core::{ffi::c_void, mem::size_of};

use crate::facade;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
  facade::malloc(size).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
  unsafe { facade::free(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
  facade::calloc(nmemb, size).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
  unsafe { facade::realloc(ptr.cast(), size).cast() }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, alignment: usize, size: usize) -> i32 {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut c_void>() {
    return libc::EINVAL;
  }

  match facade::try_memalign(alignment, size) {
    Ok(ptr) => {
      unsafe { *memptr = ptr.as_ptr().cast() };
      0
    }
    Err(e) => e.errno(),
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
  unsafe { facade::usable_size(ptr.cast()) }
}
