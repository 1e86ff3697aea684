//! Tuple storage consumed by scan stages.
use std::fmt;
use std::sync::Arc;

use stagepipe_error::{Result, StagepipeError};

/// Predicate pushed down into a storage scan.
///
/// Two predicates are equal only if one was cloned from the other.
#[derive(Clone)]
pub struct ScanPredicate {
    name: String,
    func: Arc<dyn Fn(&[u8]) -> bool + Send + Sync>,
}

impl ScanPredicate {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        ScanPredicate {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, tuple: &[u8]) -> bool {
        (self.func)(tuple)
    }
}

impl PartialEq for ScanPredicate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for ScanPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ScanPredicate").field(&self.name).finish()
    }
}

/// A source of fixed-size tuples.
pub trait TupleStore: fmt::Debug + Send + Sync {
    fn tuple_size(&self) -> usize;

    /// Open an iterator over tuples matching the predicate.
    ///
    /// The iterator is closed when dropped.
    fn open(&self, predicate: Option<&ScanPredicate>) -> Result<Box<dyn TupleIterator + '_>>;
}

pub trait TupleIterator: Send {
    /// Get the next tuple. Returns None once exhausted.
    fn next(&mut self) -> Result<Option<&[u8]>>;
}

/// Tuples held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTable {
    tuple_size: usize,
    data: Vec<u8>,
}

impl MemoryTable {
    pub fn new(tuple_size: usize) -> Result<Self> {
        if tuple_size == 0 {
            return Err(StagepipeError::new("Tuple size must be non-zero"));
        }
        Ok(MemoryTable {
            tuple_size,
            data: Vec::new(),
        })
    }

    pub fn try_from_tuples<'a>(
        tuple_size: usize,
        tuples: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Self> {
        let mut table = Self::new(tuple_size)?;
        for tuple in tuples {
            table.insert(tuple)?;
        }
        Ok(table)
    }

    pub fn insert(&mut self, tuple: &[u8]) -> Result<()> {
        if tuple.len() != self.tuple_size {
            return Err(StagepipeError::new(format!(
                "Expected tuple of size {}, got {}",
                self.tuple_size,
                tuple.len()
            )));
        }
        self.data.extend_from_slice(tuple);
        Ok(())
    }

    pub fn num_tuples(&self) -> usize {
        self.data.len() / self.tuple_size
    }
}

impl TupleStore for MemoryTable {
    fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    fn open(&self, predicate: Option<&ScanPredicate>) -> Result<Box<dyn TupleIterator + '_>> {
        Ok(Box::new(MemoryTableIter {
            tuples: self.data.chunks_exact(self.tuple_size),
            predicate: predicate.cloned(),
        }))
    }
}

struct MemoryTableIter<'a> {
    tuples: std::slice::ChunksExact<'a, u8>,
    predicate: Option<ScanPredicate>,
}

impl TupleIterator for MemoryTableIter<'_> {
    fn next(&mut self) -> Result<Option<&[u8]>> {
        match &self.predicate {
            Some(pred) => Ok(self.tuples.find(|t| pred.matches(t))),
            None => Ok(self.tuples.next()),
        }
    }
}
