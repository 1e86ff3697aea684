use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Selection and projection applied to every tuple delivered to a packet's
/// output.
pub trait TupleFilter: fmt::Debug + Send + Sync + 'static {
    /// Size of the tuples produced by the stage.
    fn input_tuple_size(&self) -> usize;

    /// Size of the tuples written to the output fifo.
    fn output_tuple_size(&self) -> usize;

    fn select(&self, tuple: &[u8]) -> bool;

    /// Write the projected form of `src` into `dest`.
    fn project(&self, dest: &mut [u8], src: &[u8]);

    /// Whether this filter selects and projects exactly like `other`.
    fn is_equivalent(&self, other: &dyn TupleFilter) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Passes every tuple through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrivialFilter {
    tuple_size: usize,
}

impl TrivialFilter {
    pub fn new(tuple_size: usize) -> Self {
        TrivialFilter { tuple_size }
    }
}

impl TupleFilter for TrivialFilter {
    fn input_tuple_size(&self) -> usize {
        self.tuple_size
    }

    fn output_tuple_size(&self) -> usize {
        self.tuple_size
    }

    fn select(&self, _tuple: &[u8]) -> bool {
        true
    }

    fn project(&self, dest: &mut [u8], src: &[u8]) {
        dest.copy_from_slice(src)
    }

    fn is_equivalent(&self, other: &dyn TupleFilter) -> bool {
        other
            .as_any()
            .downcast_ref::<TrivialFilter>()
            .is_some_and(|other| other == self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type SelectFn = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;
pub type ProjectFn = Arc<dyn Fn(&mut [u8], &[u8]) + Send + Sync>;

/// Filter backed by closures.
///
/// Without a projection function the output tuple is a prefix of the input
/// tuple. Two filters are only equivalent if they were cloned from the same
/// filter.
#[derive(Clone)]
pub struct FnFilter {
    input_tuple_size: usize,
    output_tuple_size: usize,
    select: SelectFn,
    project: Option<ProjectFn>,
}

impl FnFilter {
    pub fn new<F>(tuple_size: usize, select: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        FnFilter {
            input_tuple_size: tuple_size,
            output_tuple_size: tuple_size,
            select: Arc::new(select),
            project: None,
        }
    }

    /// Keep only the first `output_tuple_size` bytes of each tuple.
    pub fn with_prefix_projection(mut self, output_tuple_size: usize) -> Self {
        assert!(output_tuple_size <= self.input_tuple_size);
        self.output_tuple_size = output_tuple_size;
        self.project = None;
        self
    }

    pub fn with_projection<F>(mut self, output_tuple_size: usize, project: F) -> Self
    where
        F: Fn(&mut [u8], &[u8]) + Send + Sync + 'static,
    {
        self.output_tuple_size = output_tuple_size;
        self.project = Some(Arc::new(project));
        self
    }
}

impl TupleFilter for FnFilter {
    fn input_tuple_size(&self) -> usize {
        self.input_tuple_size
    }

    fn output_tuple_size(&self) -> usize {
        self.output_tuple_size
    }

    fn select(&self, tuple: &[u8]) -> bool {
        (self.select)(tuple)
    }

    fn project(&self, dest: &mut [u8], src: &[u8]) {
        match &self.project {
            Some(project) => project(dest, src),
            None => dest.copy_from_slice(&src[..dest.len()]),
        }
    }

    fn is_equivalent(&self, other: &dyn TupleFilter) -> bool {
        let other = match other.as_any().downcast_ref::<FnFilter>() {
            Some(other) => other,
            None => return false,
        };

        let same_project = match (&self.project, &other.project) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };

        self.input_tuple_size == other.input_tuple_size
            && self.output_tuple_size == other.output_tuple_size
            && Arc::ptr_eq(&self.select, &other.select)
            && same_project
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for FnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFilter")
            .field("input_tuple_size", &self.input_tuple_size)
            .field("output_tuple_size", &self.output_tuple_size)
            .field("projected", &self.project.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_equivalence() {
        let a = TrivialFilter::new(4);
        assert!(a.is_equivalent(&TrivialFilter::new(4)));
        assert!(!a.is_equivalent(&TrivialFilter::new(8)));
        assert!(!a.is_equivalent(&FnFilter::new(4, |_| true)));
    }

    #[test]
    fn fn_filter_equivalent_only_when_cloned() {
        let a = FnFilter::new(4, |_| true);
        let b = a.clone();
        let c = FnFilter::new(4, |_| true);

        assert!(a.is_equivalent(&b));
        assert!(!a.is_equivalent(&c));
    }

    #[test]
    fn prefix_projection() {
        let filter = FnFilter::new(8, |t| t[0] % 2 == 0).with_prefix_projection(4);

        let src = [2, 0, 0, 0, 9, 9, 9, 9];
        assert!(filter.select(&src));
        assert!(!filter.select(&[3, 0, 0, 0, 0, 0, 0, 0]));

        let mut dest = [0; 4];
        filter.project(&mut dest, &src);
        assert_eq!([2, 0, 0, 0], dest);
    }

    #[test]
    fn custom_projection() {
        let filter = FnFilter::new(8, |_| true).with_projection(4, |dest, src| {
            dest.copy_from_slice(&src[4..8]);
        });

        let mut dest = [0; 4];
        filter.project(&mut dest, &[1, 1, 1, 1, 5, 6, 7, 8]);
        assert_eq!([5, 6, 7, 8], dest);
    }
}
