use std::cmp::Ordering;
use std::fmt::Debug;

use stagepipe_error::{Result, StagepipeError};

/// Extracts the key bytes used for grouping, sorting and joining.
pub trait KeyExtractor: Debug + Send + Sync {
    fn key_size(&self) -> usize;

    fn extract<'a>(&self, tuple: &'a [u8]) -> &'a [u8];

    /// Check that keys can be extracted from tuples of `tuple_size` bytes.
    fn check_tuple_size(&self, _tuple_size: usize) -> Result<()> {
        Ok(())
    }
}

/// Orders extracted keys.
pub trait KeyCompare: Debug + Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Key stored at a fixed offset in the tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetKeyExtractor {
    pub offset: usize,
    pub len: usize,
}

impl OffsetKeyExtractor {
    pub fn new(offset: usize, len: usize) -> Self {
        OffsetKeyExtractor { offset, len }
    }
}

impl KeyExtractor for OffsetKeyExtractor {
    fn key_size(&self) -> usize {
        self.len
    }

    fn extract<'a>(&self, tuple: &'a [u8]) -> &'a [u8] {
        &tuple[self.offset..self.offset + self.len]
    }

    fn check_tuple_size(&self, tuple_size: usize) -> Result<()> {
        if self.offset + self.len > tuple_size {
            return Err(StagepipeError::new(format!(
                "Key at offset {} with length {} is out of bounds for tuples of size {tuple_size}",
                self.offset, self.len
            )));
        }
        Ok(())
    }
}

/// Lexicographic byte comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseCompare;

impl KeyCompare for BytewiseCompare {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Compares keys holding a little-endian i32.
#[derive(Debug, Clone, Copy, Default)]
pub struct I32Compare;

impl KeyCompare for I32Compare {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        read_i32(a).cmp(&read_i32(b))
    }
}

fn read_i32(key: &[u8]) -> i32 {
    let mut buf = [0; 4];
    buf.copy_from_slice(&key[..4]);
    i32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32_compare_is_signed() {
        let neg = (-5_i32).to_le_bytes();
        let pos = 3_i32.to_le_bytes();

        assert_eq!(Ordering::Less, I32Compare.compare(&neg, &pos));
        // Bytewise ordering disagrees for negative numbers.
        assert_eq!(Ordering::Greater, BytewiseCompare.compare(&neg, &pos));
    }

    #[test]
    fn offset_key_bounds() {
        let key = OffsetKeyExtractor::new(4, 4);
        key.check_tuple_size(8).unwrap();
        let err = key.check_tuple_size(6).unwrap_err();
        assert!(err.get_msg().contains("out of bounds"), "{err}");
    }

    #[test]
    fn offset_extract() {
        let key = OffsetKeyExtractor::new(2, 3);
        assert_eq!(&[3, 4, 5], key.extract(&[1, 2, 3, 4, 5, 6]));
    }
}
