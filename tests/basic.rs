//! Collections running on top of rcmalloc as the global allocator.

use rcmalloc::Allocator;
use std::collections::{BTreeMap, HashMap};

#[global_allocator]
static GLOBAL: Allocator = Allocator;

#[test]
fn test_box() {
  let b = Box::new(42u64);
  assert_eq!(*b, 42);
}

#[test]
fn test_vec_growth() {
  let mut v = Vec::new();
  for i in 0..100_000u32 {
    v.push(i);
  }
  assert_eq!(v.len(), 100_000);
  assert_eq!(v[77_777], 77_777);
  v.truncate(10);
  v.shrink_to_fit();
  assert_eq!(v, (0..10).collect::<Vec<_>>());
}

#[test]
fn test_string() {
  let mut s = String::new();
  for _ in 0..1000 {
    s.push_str("hello world ");
  }
  assert_eq!(s.len(), 12_000);
  assert!(s.ends_with("world "));
}

#[test]
fn test_hashmap() {
  let mut map = HashMap::new();
  for i in 0..5000 {
    map.insert(i, format!("value_{i}"));
  }
  assert_eq!(map.len(), 5000);
  assert_eq!(map[&4242], "value_4242");
  map.retain(|k, _| k % 2 == 0);
  assert_eq!(map.len(), 2500);
}

#[test]
fn test_btreemap() {
  let map: BTreeMap<u64, Vec<u8>> = (0..2000).map(|i| (i, vec![i as u8; (i % 300) as usize])).collect();
  assert_eq!(map[&1299].len(), 1299 % 300);
  assert!(map[&1299].iter().all(|&b| b == 1299u64 as u8));
}

#[test]
fn test_nested_collections() {
  let v: Vec<Vec<u32>> = (0..200).map(|i| (0..i).collect()).collect();
  for (i, inner) in v.iter().enumerate() {
    assert_eq!(inner.len(), i);
  }
}

#[test]
fn test_large_and_aligned() {
  let big = vec![7u8; 10 << 20];
  assert_eq!(big[(10 << 20) - 1], 7);

  #[repr(align(4096))]
  struct Page([u8; 4096]);
  let page = Box::new(Page([1; 4096]));
  assert_eq!(&*page as *const Page as usize % 4096, 0);
  assert_eq!(page.0[4095], 1);
}

#[test]
fn test_zeroed() {
  let v = vec![0u64; 50_000];
  assert!(v.iter().all(|&x| x == 0));
  let small = vec![0u16; 100];
  assert!(small.iter().all(|&x| x == 0));
}
