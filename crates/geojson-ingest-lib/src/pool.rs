//! Content-addressed pool of attribute keys and values
//!
//! Each distinct `(type, text)` pair is appended once to a byte buffer as
//! `type byte, varint length, UTF-8 text`. The byte offset of the entry is its
//! [`PoolRef`], so references are stable for the whole run and can be resolved by
//! anyone holding the buffer.

use crate::attribute::{AttributeType, AttributeValue};
use crate::serial::{read_uvarint, write_uvarint};
use crate::{IngestError, Result};
use byteorder::ReadBytesExt;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Reference to an interned entry: its byte offset in the pool buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolRef(u64);

impl PoolRef {
    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn offset(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    buffer: Vec<u8>,
    entries: HashMap<(AttributeType, String), PoolRef>,
}

/// Deduplicated, append-only pool shared by all segments of a run
#[derive(Debug, Default)]
pub struct MetadataPool {
    inner: Mutex<PoolInner>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl MetadataPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // The pool is only ever appended to, so a panicked writer leaves it usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Intern a value, returning the reference of the existing entry if there is one
    pub fn intern(&self, attr_type: AttributeType, text: &str) -> PoolRef {
        let mut inner = self.lock();
        let key = (attr_type, text.to_string());
        if let Some(existing) = inner.entries.get(&key) {
            return *existing;
        }

        let pool_ref = PoolRef(inner.buffer.len() as u64);
        inner.buffer.push(attr_type.code());
        // Writing to a Vec cannot fail
        let _ = write_uvarint(&mut inner.buffer, text.len() as u64);
        inner.buffer.extend_from_slice(text.as_bytes());
        inner.entries.insert(key, pool_ref);
        pool_ref
    }

    /// Intern an attribute key, which is always stored as a string
    pub fn intern_key(&self, key: &str) -> PoolRef {
        self.intern(AttributeType::String, key)
    }

    pub fn intern_value(&self, value: &AttributeValue) -> PoolRef {
        self.intern(value.attr_type, &value.text)
    }

    /// Look up the entry stored at `pool_ref`
    pub fn resolve(&self, pool_ref: PoolRef) -> Result<AttributeValue> {
        resolve_in(&self.lock().buffer, pool_ref)
    }

    /// Number of distinct entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the pool buffer in bytes
    pub fn byte_len(&self) -> u64 {
        self.lock().buffer.len() as u64
    }

    /// Write the pool buffer
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.lock().buffer)?;
        Ok(())
    }
}

/// Decode the entry at `pool_ref` of a pool buffer
pub fn resolve_in(buffer: &[u8], pool_ref: PoolRef) -> Result<AttributeValue> {
    let corrupt = || IngestError::CorruptStream(format!("no pool entry at offset {}", pool_ref.0));

    let mut r = buffer.get(pool_ref.0 as usize..).ok_or_else(corrupt)?;
    let code = r.read_u8()?;
    let attr_type = AttributeType::from_code(code).ok_or_else(corrupt)?;
    let len = read_uvarint(&mut r)? as usize;
    let text = r.get(..len).ok_or_else(corrupt)?;
    let text = std::str::from_utf8(text).map_err(|_| corrupt())?;

    Ok(AttributeValue::new(attr_type, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_intern_is_idempotent() {
        let pool = MetadataPool::new();
        let a = pool.intern(AttributeType::String, "name");
        let b = pool.intern(AttributeType::Number, "5");
        assert_ne!(a, b);
        assert_eq!(pool.intern(AttributeType::String, "name"), a);
        assert_eq!(pool.len(), 2);
        assert_eq!(a.offset(), 0);
    }

    #[test]
    fn test_type_is_part_of_identity() {
        let pool = MetadataPool::new();
        let s = pool.intern(AttributeType::String, "true");
        let b = pool.intern(AttributeType::Bool, "true");
        assert_ne!(s, b);
        assert_eq!(pool.resolve(s).unwrap().attr_type, AttributeType::String);
        assert_eq!(pool.resolve(b).unwrap().attr_type, AttributeType::Bool);
    }

    #[test]
    fn test_resolve_from_written_buffer() {
        let pool = MetadataPool::new();
        let key = pool.intern_key("population");
        let value = pool.intern_value(&AttributeValue::new(AttributeType::Number, "8336817"));

        let mut buffer = Vec::new();
        pool.write_to(&mut buffer).unwrap();
        assert_eq!(buffer.len() as u64, pool.byte_len());
        assert_eq!(
            resolve_in(&buffer, key).unwrap(),
            AttributeValue::new(AttributeType::String, "population")
        );
        assert_eq!(
            resolve_in(&buffer, value).unwrap(),
            AttributeValue::new(AttributeType::Number, "8336817")
        );
        assert!(resolve_in(&buffer, PoolRef::new(10_000)).is_err());
    }

    #[test]
    fn test_concurrent_interning_agrees() {
        let pool = MetadataPool::new();
        let refs: Vec<Vec<PoolRef>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..100)
                            .map(|i| pool.intern(AttributeType::Number, &i.to_string()))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(pool.len(), 100);
        assert!(refs.windows(2).all(|w| w[0] == w[1]));
    }

    proptest! {
        #[test]
        fn prop_same_content_same_ref(texts in prop::collection::vec("[a-z0-9é]{0,8}", 1..40)) {
            let pool = MetadataPool::new();
            let first: Vec<PoolRef> = texts.iter().map(|t| pool.intern(AttributeType::String, t)).collect();
            let second: Vec<PoolRef> = texts.iter().map(|t| pool.intern(AttributeType::String, t)).collect();
            prop_assert_eq!(&first, &second);

            for (text, pool_ref) in texts.iter().zip(&first) {
                prop_assert_eq!(&pool.resolve(*pool_ref).unwrap().text, text);
            }
        }
    }
}
