//! Restartable critical sections.
//!
//! A section is a closure that reads the current CPU, inspects that CPU's
//! heap and then commits with a single pointer update. Before committing the
//! body asks [`Section::preempted`]; if the preemption notifier flagged the
//! thread since the section started, the body backs out with
//! [`Step::Restart`] and runs again from the top on whatever CPU the thread
//! now occupies.
//!
//! The notifier talks to this module through [`notify_preemption`], which it
//! must invoke on the preempted thread itself (from a signal handler or an
//! upcall). Without a kernel-side notifier the heap additionally takes a short
//! per-CPU lock around each section, so correctness never depends on the
//! notice arriving.

use core::{
  cell::Cell,
  sync::atomic::{AtomicBool, AtomicUsize, Ordering, compiler_fence},
};

use crate::{platform, stats};

pub(crate) struct ThreadState {
  /// Last CPU id observed by this thread.
  cpu: AtomicUsize,
  /// Inside a section; read by the notifier.
  restartable: AtomicBool,
  /// Set by the notifier; consumed before commit.
  restart_pending: AtomicBool,
  restarts: Cell<u64>,
}

impl ThreadState {
  const fn new() -> Self {
    Self {
      cpu: AtomicUsize::new(0),
      restartable: AtomicBool::new(false),
      restart_pending: AtomicBool::new(false),
      restarts: Cell::new(0),
    }
  }
}

thread_local! {
  static THREAD: ThreadState = const { ThreadState::new() };
}

/// Outcome of one pass through a section body.
pub(crate) enum Step<T> {
  /// Committed.
  Done(T),
  /// Nothing to do on this CPU; the caller takes the slow path.
  Abort,
  /// Preempted before commit; run the body again.
  Restart,
}

pub(crate) struct Section<'a> {
  state: &'a ThreadState,
  cpu: usize,
}

impl Section<'_> {
  /// CPU id read when this pass started.
  #[inline]
  pub(crate) fn cpu(&self) -> usize {
    self.cpu
  }

  /// Consumes a pending restart request. Must be the last check before the
  /// commit store.
  #[inline]
  pub(crate) fn preempted(&self) -> bool {
    compiler_fence(Ordering::SeqCst);
    self.state.restart_pending.swap(false, Ordering::Relaxed)
  }
}

/// Runs `body` as a restartable section. Returns `None` when the body aborts.
#[inline]
pub(crate) fn run<T>(mut body: impl FnMut(&Section<'_>) -> Step<T>) -> Option<T> {
  match THREAD.try_with(|state| drive(state, &mut body)) {
    Ok(out) => out,
    // Thread-local storage already torn down: nobody can notify us anyway.
    Err(_) => drive(&ThreadState::new(), &mut body),
  }
}

#[inline]
fn drive<T>(state: &ThreadState, body: &mut impl FnMut(&Section<'_>) -> Step<T>) -> Option<T> {
  loop {
    state.restart_pending.store(false, Ordering::Relaxed);
    state.restartable.store(true, Ordering::Relaxed);
    compiler_fence(Ordering::SeqCst);

    let cpu = platform::cpu_id();
    state.cpu.store(cpu, Ordering::Relaxed);
    let step = body(&Section { state, cpu });

    compiler_fence(Ordering::SeqCst);
    state.restartable.store(false, Ordering::Relaxed);

    match step {
      Step::Done(value) => return Some(value),
      Step::Abort => return None,
      Step::Restart => {
        state.restarts.set(state.restarts.get() + 1);
        stats::COUNTERS.restart();
      }
    }
  }
}

/// Reads the current CPU outside of a section and caches it.
pub(crate) fn refresh_cpu() -> usize {
  let cpu = platform::cpu_id();
  let _ = THREAD.try_with(|state| state.cpu.store(cpu, Ordering::Relaxed));
  cpu
}

/// Preemption notice for the calling thread.
///
/// Meant for the preemption notifier, running on the thread that was just
/// descheduled or migrated. If the thread is inside a section, the section is
/// forced to restart from its beginning instead of committing, and `true` is
/// returned. Async-signal-safe.
pub fn notify_preemption() -> bool {
  THREAD
    .try_with(|state| {
      if state.restartable.load(Ordering::Relaxed) {
        state.restart_pending.store(true, Ordering::Relaxed);
        true
      } else {
        false
      }
    })
    .unwrap_or(false)
}

/// Whether the calling thread is currently inside a section.
pub fn in_critical_section() -> bool {
  THREAD
    .try_with(|state| state.restartable.load(Ordering::Relaxed))
    .unwrap_or(false)
}

/// CPU id cached by the calling thread's last section.
pub fn cached_cpu() -> usize {
  THREAD
    .try_with(|state| state.cpu.load(Ordering::Relaxed))
    .unwrap_or(0)
}

/// Sections the calling thread had to re-execute.
pub fn thread_restarts() -> u64 {
  THREAD.try_with(|state| state.restarts.get()).unwrap_or(0)
}
