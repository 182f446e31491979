//! Binary image cache.
//!
//! Images are registered once by name and shared by every iteration of
//! every task that runs them. Re-registering a name replaces the image for
//! future spawns; running instances keep the image they started with.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const PT_INTERP: u32 = 3;

/// Loaded executable image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryImage {
    name: String,
    bytes: Arc<[u8]>,
}

impl BinaryImage {
    /// Wrap raw image bytes.
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image contents.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Image size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the image is an ELF file requesting a program interpreter.
    ///
    /// Anything that is not a well-formed little-endian ELF is reported as
    /// statically linked.
    #[must_use]
    pub fn is_dynamically_linked(&self) -> bool {
        elf_has_interp(&self.bytes).unwrap_or(false)
    }
}

fn read_u16(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(b: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(at..at + 8)?.try_into().ok()?))
}

fn elf_has_interp(b: &[u8]) -> Option<bool> {
    if b.get(..4)? != ELF_MAGIC || *b.get(5)? != 1 {
        return None;
    }
    let (phoff, phentsize, phnum) = match *b.get(4)? {
        1 => (
            usize::try_from(read_u32(b, 0x1c)?).ok()?,
            usize::from(read_u16(b, 0x2a)?),
            usize::from(read_u16(b, 0x2c)?),
        ),
        2 => (
            usize::try_from(read_u64(b, 0x20)?).ok()?,
            usize::from(read_u16(b, 0x36)?),
            usize::from(read_u16(b, 0x38)?),
        ),
        _ => return None,
    };
    for i in 0..phnum {
        let entry = phoff.checked_add(i.checked_mul(phentsize)?)?;
        if read_u32(b, entry)? == PT_INTERP {
            return Some(true);
        }
    }
    Some(false)
}

/// Name-indexed cache of registered images.
#[derive(Debug, Default)]
pub struct BinaryCache {
    images: RwLock<HashMap<String, Arc<BinaryImage>>>,
}

impl BinaryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an image. Returns the previous image, if any.
    pub fn insert(&self, image: BinaryImage) -> Option<Arc<BinaryImage>> {
        let name = image.name().to_owned();
        tracing::debug!(binary = %name, size = image.len(), "binary registered");
        self.images.write().insert(name, Arc::new(image))
    }

    /// Look up an image by name.
    pub fn get(&self, name: &str) -> Option<Arc<BinaryImage>> {
        self.images.read().get(name).cloned()
    }

    /// Number of cached images.
    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    /// Whether no image is cached.
    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }
}
