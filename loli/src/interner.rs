//! String interning for library and function names
//!
//! Hot paths carry a [`StringHash`]; the text is only looked up for rendering.
//! Every [`ProfileSnapshot`](crate::snapshot::ProfileSnapshot) owns its own
//! interner, so a baseline and a comparison snapshot never share state.
//!
//! Hashes are xxHash32 of the UTF-8 bytes, which keeps them stable across
//! processes and `.loli` files. Two distinct strings hashing to the same value
//! is not supported: the first string wins.

use crate::domain::StringHash;
use std::collections::HashMap;
use twox_hash::XxHash32;

const HASH_SEED: u32 = 0;

/// Library name used for frames outside every known mapping
pub const UNKNOWN_LIBRARY: &str = "unknown";

/// Hash a string without interning it
#[must_use]
pub fn hash_str(text: &str) -> StringHash {
    let hash = XxHash32::oneshot(HASH_SEED, text.as_bytes());
    // 0 is reserved for the empty handle
    StringHash(if hash == 0 { 1 } else { hash })
}

#[derive(Debug, Default, Clone)]
pub struct StringInterner {
    strings: HashMap<StringHash, String>,
}

impl StringInterner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text` and return its handle
    pub fn intern(&mut self, text: &str) -> StringHash {
        let hash = hash_str(text);
        self.strings.entry(hash).or_insert_with(|| text.to_owned());
        hash
    }

    /// Register a `(hash, text)` pair read back from a file
    pub fn insert(&mut self, hash: StringHash, text: String) {
        self.strings.entry(hash).or_insert(text);
    }

    #[must_use]
    pub fn get(&self, hash: StringHash) -> Option<&str> {
        self.strings.get(&hash).map(String::as_str)
    }

    /// Text for `hash`, or `""` when unknown
    #[must_use]
    pub fn resolve(&self, hash: StringHash) -> &str {
        self.get(hash).unwrap_or("")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StringHash, &str)> {
        self.strings.iter().map(|(hash, text)| (*hash, text.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut a = StringInterner::new();
        let mut b = StringInterner::new();
        let ha = a.intern("libunity.so");
        let hb = b.intern("libunity.so");
        assert_eq!(ha, hb);
        assert_eq!(ha, hash_str("libunity.so"));
        assert_eq!(a.resolve(ha), "libunity.so");
    }

    #[test]
    fn test_interners_are_independent() {
        let mut a = StringInterner::new();
        let b = StringInterner::new();
        let hash = a.intern("libc.so");
        assert_eq!(b.get(hash), None);
        assert_eq!(b.resolve(hash), "");
    }

    #[test]
    fn test_intern_twice_keeps_one_entry() {
        let mut interner = StringInterner::new();
        interner.intern("libc.so");
        interner.intern("libc.so");
        assert_eq!(interner.len(), 1);
        assert!(!hash_str("libc.so").is_empty());
    }
}
