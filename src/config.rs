use crate::platform;

/// Upper bound on per-CPU heaps. CPU ids beyond it share heaps modulo the
/// heap count.
pub const MAX_CPUS: usize = 256;

/// Consecutive global-heap scans an idle superblock must be passed over
/// before its pages are released.
pub const RECLAIM_AFTER_SCANS: u32 = 8;

/// Values queried from the OS once at bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  pub page_size: usize,
  pub cpu_count: usize,
  pub reclaim_after_scans: u32,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      page_size: platform::FALLBACK_PAGE_SIZE,
      cpu_count: platform::FALLBACK_CPU_COUNT,
      reclaim_after_scans: RECLAIM_AFTER_SCANS,
    }
  }
}

impl Config {
  /// Queries page size and CPU count, falling back to the defaults when a
  /// query fails.
  pub fn detect() -> Self {
    Self {
      page_size: platform::page_size(),
      cpu_count: platform::cpu_count(),
      ..Self::default()
    }
  }

  /// Number of per-CPU heaps actually in use.
  pub fn heap_count(&self) -> usize {
    self.cpu_count.clamp(1, MAX_CPUS)
  }

  /// Maps a raw CPU id onto a heap index.
  #[inline]
  pub fn heap_index(&self, cpu: usize) -> usize {
    cpu % self.heap_count()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detect_matches_platform() {
    let config = Config::detect();
    assert!(config.page_size.is_power_of_two());
    assert!(config.cpu_count >= 1);
    assert_eq!(config.reclaim_after_scans, RECLAIM_AFTER_SCANS);
  }

  #[test]
  fn heap_count_is_capped() {
    let config = Config {
      cpu_count: 4 * MAX_CPUS,
      ..Config::default()
    };
    assert_eq!(config.heap_count(), MAX_CPUS);
    assert_eq!(config.heap_index(MAX_CPUS + 3), 3);
  }

  #[test]
  fn sparse_cpu_ids_wrap() {
    let config = Config {
      cpu_count: 6,
      ..Config::default()
    };
    assert_eq!(config.heap_index(5), 5);
    assert_eq!(config.heap_index(6), 0);
    assert_eq!(config.heap_index(13), 1);
  }
}
