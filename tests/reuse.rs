//! Freed blocks are reused before any new superblock is carved.
//!
//! Kept as the only test in its binary: it compares process-wide counters.

#[cfg(target_os = "linux")]
fn pin_to_current_cpu() {
  unsafe {
    let cpu = libc::sched_getcpu();
    if cpu < 0 {
      return;
    }
    let mut set: libc::cpu_set_t = std::mem::zeroed();
    libc::CPU_ZERO(&mut set);
    libc::CPU_SET(cpu as usize, &mut set);
    libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set);
  }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_current_cpu() {}

fn sizes() -> impl Iterator<Item = usize> {
  (0..3000).map(|i| 1 + (i * 37) % 4000)
}

#[test]
fn freed_blocks_are_reused() {
  pin_to_current_cpu();

  let first: Vec<*mut u8> = sizes().map(rcmalloc::malloc).collect();
  assert!(first.iter().all(|p| !p.is_null()));
  let created = rcmalloc::stats().superblocks;
  assert!(created > 0);

  for p in first {
    unsafe { rcmalloc::free(p) };
  }

  let second: Vec<*mut u8> = sizes().map(rcmalloc::malloc).collect();
  let after = rcmalloc::stats();
  assert_eq!(after.superblocks, created, "re-allocation carved new superblocks");
  assert!(after.fast_allocs >= 3000);

  for p in second {
    unsafe { rcmalloc::free(p) };
  }
}
