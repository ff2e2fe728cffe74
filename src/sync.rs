use core::{
  hint,
  sync::atomic::{AtomicBool, Ordering},
};

/// Busy-wait rounds before a waiter starts yielding its timeslice.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Test-and-test-and-set lock. Every critical section guarded by one of these
/// is a handful of pointer writes, so waiters spin briefly and then yield in
/// case the holder was descheduled.
pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> SpinGuard<'_> {
    let mut spins = 0;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPINS_BEFORE_YIELD {
          spins += 1;
          hint::spin_loop();
        } else {
          std::thread::yield_now();
        }
      }
    }
    SpinGuard { lock: self }
  }

  #[cfg(test)]
  pub(crate) fn is_locked(&self) -> bool {
    self.locked.load(Ordering::Relaxed)
  }
}

pub(crate) struct SpinGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}
