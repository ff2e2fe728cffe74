//! Size class table.
//!
//! Built once at bootstrap from the page size. Sizes here always include the
//! block header, so a class of `size` bytes hands out `size - HEADER_SIZE`
//! usable bytes.

use crate::error::Error;

/// Capacity of the class table, class 0 included. Enough for 64 KiB pages.
pub const MAX_CLASSES: usize = 80;

/// Largest size resolved at 8-byte granularity.
pub const MAX_SMALL_SIZE: usize = 1024;

/// Largest size served by superblocks. Anything bigger is mapped directly.
pub const MAX_LARGE_SIZE: usize = 32 * 1024;

/// Class id stamped on blocks that bypass the superblocks.
pub const OVERSIZE_CLASS: u8 = u8::MAX;

const SMALL_ALIGN: usize = 8;
/// Minimum class alignment, enough for SSE types.
const MIN_ALIGN: usize = 16;

/// Bytes worth of blocks we want to move between tiers in one batch.
const TRANSFER_BYTES: usize = 64 * 1024;

/// Length of the flat lookup array.
pub const LOOKUP_LEN: usize = lookup_index(MAX_LARGE_SIZE) + 1;

const _: () = assert!(LOOKUP_LEN == 377);
const _: () = assert!(lookup_index(MAX_SMALL_SIZE) == 128);
const _: () = assert!(lookup_index(MAX_SMALL_SIZE + 1) == 129);
const _: () = assert!(MAX_CLASSES < OVERSIZE_CLASS as usize);

/// Sizes up to 1024 are indexed by `ceil(size / 8)`, larger ones by
/// `ceil(size / 128)`. Both ranges share one physical array: the large range
/// is shifted by 120 so that it starts right after index 128.
///
/// ```text
///   size   index
///   0      0
///   1024   128
///   1025   129
///   32768  376
/// ```
#[inline(always)]
pub const fn lookup_index(size: usize) -> usize {
  if size <= MAX_SMALL_SIZE {
    (size + 7) >> 3
  } else {
    (size + 127 + (120 << 7)) >> 7
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
  pub id: u8,
  /// Block size, header included.
  pub size: usize,
  /// Pages per superblock span.
  pub pages: usize,
  /// Blocks per superblock span.
  pub blocks: usize,
}

impl SizeClass {
  const EMPTY: Self = Self {
    id: 0,
    size: 0,
    pages: 0,
    blocks: 0,
  };
}

pub struct SizeClassTable {
  classes: [SizeClass; MAX_CLASSES],
  /// Number of occupied entries, class 0 included.
  count: usize,
  lookup: [u8; LOOKUP_LEN],
}

impl SizeClassTable {
  pub fn new(page_size: usize) -> Result<Self, Error> {
    if !page_size.is_power_of_two() {
      return Err(Error::InitializationFailure);
    }

    let mut table = Self {
      classes: [SizeClass::EMPTY; MAX_CLASSES],
      count: 1,
      lookup: [0; LOOKUP_LEN],
    };

    let mut size = MIN_ALIGN;
    while size <= MAX_LARGE_SIZE {
      let alignment = alignment_for(size, page_size);
      let pages = span_pages(size, page_size);
      let blocks = pages * page_size / size;

      let last = &mut table.classes[table.count - 1];
      if table.count > 1 && last.pages == pages && last.blocks == blocks {
        // Same span shape: widen the previous class instead of adding one.
        last.size = size;
      } else {
        if table.count == MAX_CLASSES {
          return Err(Error::InitializationFailure);
        }
        table.classes[table.count] = SizeClass {
          id: table.count as u8,
          size,
          pages,
          blocks,
        };
        table.count += 1;
      }
      size += alignment;
    }

    let mut next_size = 0;
    for class in &table.classes[1..table.count] {
      let mut s = next_size;
      while s <= class.size {
        table.lookup[lookup_index(s)] = class.id;
        s += SMALL_ALIGN;
      }
      next_size = class.size + SMALL_ALIGN;
    }

    Ok(table)
  }

  /// Resolves a size (header included) to its class id, or `None` when the
  /// size must be mapped directly.
  #[inline]
  pub fn class_of(&self, size: usize) -> Option<usize> {
    if size > MAX_LARGE_SIZE {
      return None;
    }
    Some(self.lookup[lookup_index(size)] as usize)
  }

  #[inline]
  pub fn class(&self, id: usize) -> &SizeClass {
    debug_assert!(id > 0 && id < self.count, "class {id} out of range");
    &self.classes[id]
  }

  /// Largest size (header included) served by class `id`.
  #[inline]
  pub fn max_size(&self, id: usize) -> usize {
    self.class(id).size
  }

  /// Number of real classes (class 0 excluded).
  pub fn len(&self) -> usize {
    self.count - 1
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Highest valid class id plus one; sizes per-class arrays.
  pub fn bound(&self) -> usize {
    self.count
  }

  pub fn iter(&self) -> impl Iterator<Item = &SizeClass> {
    self.classes[1..self.count].iter()
  }
}

/// Space wasted to alignment stays under 1/8 of the size.
fn alignment_for(size: usize, page_size: usize) -> usize {
  let alignment = if size > MAX_LARGE_SIZE {
    page_size
  } else if size >= 128 {
    (1 << lg_floor(size)) / 8
  } else if size >= MIN_ALIGN {
    MIN_ALIGN
  } else {
    SMALL_ALIGN
  };
  alignment.min(page_size)
}

#[inline]
fn lg_floor(size: usize) -> u32 {
  usize::BITS - 1 - size.leading_zeros()
}

fn blocks_to_move(size: usize) -> usize {
  (TRANSFER_BYTES / size).clamp(2, 32) / 4
}

/// Smallest page count whose leftover is at most 1/8 of the span and which
/// holds at least one transfer batch.
fn span_pages(size: usize, page_size: usize) -> usize {
  let batch = blocks_to_move(size);
  let mut span = 0;
  loop {
    span += page_size;
    while span % size > span >> 3 {
      span += page_size;
    }
    if span / size >= batch {
      return span / page_size;
    }
  }
}
