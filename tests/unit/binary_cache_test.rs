//! Tests for binary registration and linkage detection

use std::sync::Arc;
use std::thread;

use prometheus_taskloader::core::{BinaryCache, BinaryImage};

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

fn elf64(segments: &[u32]) -> Vec<u8> {
    let mut image = vec![0u8; 64];
    image[..4].copy_from_slice(b"\x7fELF");
    image[4] = 2;
    image[5] = 1;
    image[0x20..0x28].copy_from_slice(&64u64.to_le_bytes());
    image[0x36..0x38].copy_from_slice(&56u16.to_le_bytes());
    let count = u16::try_from(segments.len()).unwrap();
    image[0x38..0x3a].copy_from_slice(&count.to_le_bytes());
    for kind in segments {
        let mut phdr = vec![0u8; 56];
        phdr[..4].copy_from_slice(&kind.to_le_bytes());
        image.extend(phdr);
    }
    image
}

#[test]
fn test_interpreter_marks_dynamic_binary() {
    let dynamic = BinaryImage::new("dyn", elf64(&[PT_LOAD, PT_INTERP]));
    let fixed = BinaryImage::new("static", elf64(&[PT_LOAD, PT_LOAD]));
    assert!(dynamic.is_dynamically_linked());
    assert!(!fixed.is_dynamically_linked());
}

#[test]
fn test_truncated_or_foreign_images_are_static() {
    let mut truncated = elf64(&[PT_INTERP]);
    truncated.truncate(60);
    assert!(!BinaryImage::new("cut", truncated).is_dynamically_linked());
    assert!(!BinaryImage::new("script", b"#!/bin/sh\n".to_vec()).is_dynamically_linked());
    assert!(!BinaryImage::new("empty", Vec::<u8>::new()).is_dynamically_linked());
}

#[test]
fn test_cache_replaces_by_name() {
    let cache = BinaryCache::new();
    assert!(cache.insert(BinaryImage::new("app", vec![1u8, 2])).is_none());
    let previous = cache.insert(BinaryImage::new("app", vec![3u8])).unwrap();
    assert_eq!(previous.bytes(), [1, 2]);
    assert_eq!(cache.get("app").unwrap().bytes(), [3]);
    assert_eq!(cache.len(), 1);
    assert!(cache.get("other").is_none());
}

#[test]
fn test_cache_concurrent_readers() {
    let cache = Arc::new(BinaryCache::new());
    cache.insert(BinaryImage::new("shared", vec![7u8; 1024]));
    let readers: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..1000 {
                    assert_eq!(cache.get("shared").unwrap().len(), 1024);
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }
}
