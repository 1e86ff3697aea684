//! Fixed-size tuples and the pages used to move them between stages.
pub mod fifo;
pub mod filter;
pub mod key;

use std::io::{ErrorKind, Read, Write};

use stagepipe_error::{Result, StagepipeError};

/// Default size in bytes of a page.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Result of pushing tuples somewhere downstream.
///
/// Only `Continue` means the producer should keep going. Neither of the other
/// variants is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Tuples were accepted.
    Continue,

    /// None of the consumers attached to a stage want any more tuples.
    StopEarly,

    /// The consumer of a buffer terminated it.
    Terminated,
}

impl Outcome {
    pub fn should_stop(&self) -> bool {
        !matches!(self, Outcome::Continue)
    }
}

/// An append-only page of fixed-size tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    tuple_size: usize,
    /// Max number of tuples this page holds.
    capacity: usize,
    /// Tuple bytes, always a multiple of `tuple_size`.
    data: Vec<u8>,
}

impl Page {
    /// Create a page holding as many tuples as fit in `page_size` bytes.
    ///
    /// A page always holds at least one tuple, even if the tuple is larger
    /// than `page_size`.
    pub fn new(tuple_size: usize, page_size: usize) -> Self {
        assert_ne!(0, tuple_size, "tuple size must be non-zero");
        let capacity = std::cmp::max(1, page_size / tuple_size);
        Page {
            tuple_size,
            capacity,
            data: Vec::with_capacity(capacity * tuple_size),
        }
    }

    /// Create a page, erroring if not even a single tuple fits.
    pub fn try_new(tuple_size: usize, page_size: usize) -> Result<Self> {
        if tuple_size == 0 {
            return Err(StagepipeError::new("Tuple size must be non-zero"));
        }
        if tuple_size > page_size {
            return Err(StagepipeError::new(format!(
                "Tuple size {tuple_size} exceeds page size {page_size}"
            )));
        }
        Ok(Self::new(tuple_size, page_size))
    }

    /// Create an empty page with the same tuple size and capacity.
    pub fn empty_like(&self) -> Self {
        Page {
            tuple_size: self.tuple_size,
            capacity: self.capacity,
            data: Vec::with_capacity(self.capacity * self.tuple_size),
        }
    }

    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn tuple_count(&self) -> usize {
        self.data.len() / self.tuple_size
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tuple_count() == self.capacity
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Get a zeroed slot for the next tuple, or None if the page is full.
    pub fn allocate(&mut self) -> Option<&mut [u8]> {
        if self.is_full() {
            return None;
        }
        let start = self.data.len();
        self.data.resize(start + self.tuple_size, 0);
        Some(&mut self.data[start..])
    }

    /// Copy a tuple into the page.
    pub fn append(&mut self, tuple: &[u8]) -> Result<()> {
        if tuple.len() != self.tuple_size {
            return Err(StagepipeError::new(format!(
                "Expected tuple of size {}, got {}",
                self.tuple_size,
                tuple.len()
            )));
        }
        match self.allocate() {
            Some(slot) => {
                slot.copy_from_slice(tuple);
                Ok(())
            }
            None => Err(StagepipeError::new("Page is full")),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        let start = idx * self.tuple_size;
        self.data.get(start..start + self.tuple_size)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.data.chunks_exact(self.tuple_size)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Fill the page from a reader, stopping when the page is full or the
    /// reader is exhausted.
    ///
    /// Returns false if no tuples were read. Errors if the reader ends in the
    /// middle of a tuple.
    pub fn fill_from_reader(&mut self, reader: &mut impl Read) -> Result<bool> {
        self.clear();
        self.data.resize(self.capacity * self.tuple_size, 0);

        let mut filled = 0;
        while filled < self.data.len() {
            match reader.read(&mut self.data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.data.clear();
                    return Err(e.into());
                }
            }
        }

        if filled % self.tuple_size != 0 {
            self.data.clear();
            return Err(StagepipeError::new(format!(
                "Read partial tuple, {filled} bytes is not a multiple of tuple size {}",
                self.tuple_size
            )));
        }

        self.data.truncate(filled);
        Ok(filled > 0)
    }

    /// Write all tuples in the page.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&self.data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_capacity_from_page_size() {
        let page = Page::new(4, 10);
        assert_eq!(2, page.capacity());

        let page = Page::new(16, 8);
        assert_eq!(1, page.capacity());

        Page::try_new(16, 8).unwrap_err();
    }

    #[test]
    fn append_until_full() {
        let mut page = Page::new(4, 8);
        page.append(&1_i32.to_le_bytes()).unwrap();
        assert!(!page.is_full());
        page.append(&2_i32.to_le_bytes()).unwrap();
        assert!(page.is_full());

        page.append(&3_i32.to_le_bytes()).unwrap_err();
        assert!(page.allocate().is_none());

        let tuples: Vec<_> = page.iter().collect();
        assert_eq!(vec![&1_i32.to_le_bytes()[..], &2_i32.to_le_bytes()[..]], tuples);
    }

    #[test]
    fn append_wrong_size() {
        let mut page = Page::new(4, 8);
        page.append(&[1, 2]).unwrap_err();
        assert!(page.is_empty());
    }

    #[test]
    fn fill_from_reader_pages() {
        let bytes: Vec<u8> = (0..5_i32).flat_map(|v| v.to_le_bytes()).collect();
        let mut reader = &bytes[..];

        let mut page = Page::new(4, 8);
        assert!(page.fill_from_reader(&mut reader).unwrap());
        assert_eq!(2, page.tuple_count());
        assert!(page.fill_from_reader(&mut reader).unwrap());
        assert_eq!(2, page.tuple_count());
        assert!(page.fill_from_reader(&mut reader).unwrap());
        assert_eq!(1, page.tuple_count());
        assert_eq!(Some(&4_i32.to_le_bytes()[..]), page.get(0));
        assert!(!page.fill_from_reader(&mut reader).unwrap());
    }

    #[test]
    fn fill_from_reader_partial_tuple() {
        let bytes = [1, 2, 3, 4, 5, 6];
        let mut reader = &bytes[..];

        let mut page = Page::new(4, 8);
        page.fill_from_reader(&mut reader).unwrap_err();
        assert!(page.is_empty());
    }
}
