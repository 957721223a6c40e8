//! xxHash-based structural keys for the command text cache.
//!
//! Keys are deterministic 64-bit hashes over the SQL-relevant parts of a
//! request, so two requests with the same shape share compiled SQL
//! regardless of object identity.

use xxhash_rust::xxh64;

/// Fixed seed for deterministic hashing.
const SEED: u64 = 0x517cc1b727220a95;

/// Incremental builder for a structural key.
///
/// Parts are separated by a record separator and absent parts are encoded
/// with a NULL marker, so `("ab", "c")` and `("a", "bc")` hash apart and
/// `None` never collides with the string `"NULL"`.
#[derive(Debug, Default, Clone)]
pub struct KeyBuilder {
    buf: String,
    parts: usize,
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one part.
    pub fn part(mut self, value: &str) -> Self {
        self.separate();
        self.buf.push_str(value);
        self
    }

    /// Append an optional part.
    pub fn opt(mut self, value: Option<&str>) -> Self {
        self.separate();
        match value {
            Some(v) => self.buf.push_str(v),
            None => self.buf.push_str("\x00NULL\x00"),
        }
        self
    }

    /// Append an ordered list as a single part.
    pub fn list<S: AsRef<str>>(mut self, values: &[S]) -> Self {
        self.separate();
        self.buf.push('[');
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                self.buf.push('\x1F'); // unit separator
            }
            self.buf.push_str(v.as_ref());
        }
        self.buf.push(']');
        self
    }

    pub fn finish(&self) -> u64 {
        hash_str(&self.buf)
    }

    fn separate(&mut self) {
        if self.parts > 0 {
            self.buf.push('\x1E'); // record separator
        }
        self.parts += 1;
    }
}

/// Hash a single string.
pub fn hash_str(input: &str) -> u64 {
    xxh64::xxh64(input.as_bytes(), SEED)
}
