use thiserror::Error;

/// Failures surfaced by the allocator. None of them is fatal; the raw entry
/// points turn every variant into a null return (or a no-op) plus `errno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
  /// The OS refused to hand out pages, the arena is exhausted, or a size
  /// computation overflowed.
  #[error("out of memory")]
  OutOfMemory,
  /// The pointer does not belong to a live block of this allocator.
  #[error("pointer {0:#x} is not a live allocation")]
  InvalidFree(usize),
  /// Bootstrap could not complete (arena reservation or class table).
  #[error("allocator initialization failed")]
  InitializationFailure,
}

impl Error {
  /// The errno value reported at the C boundary.
  pub fn errno(&self) -> i32 {
    match self {
      Error::InvalidFree(_) => libc::EINVAL,
      Error::OutOfMemory | Error::InitializationFailure => libc::ENOMEM,
    }
  }
}
