use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use stagepipe_error::{Result, StagepipeError};
use tracing::trace;

use super::{Outcome, Page, DEFAULT_PAGE_SIZE};

/// Sizing for a tuple fifo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoConfig {
    /// Page size in bytes.
    pub page_size: usize,

    /// Max number of published pages waiting to be read. Unbounded if None.
    pub capacity: Option<usize>,
}

impl Default for FifoConfig {
    fn default() -> Self {
        FifoConfig {
            page_size: DEFAULT_PAGE_SIZE,
            capacity: None,
        }
    }
}

/// Create a fifo with the default page size and no capacity bound.
pub fn tuple_fifo(tuple_size: usize) -> Result<(FifoWriter, FifoReader)> {
    tuple_fifo_with_config(tuple_size, FifoConfig::default())
}

/// Create a single producer, single consumer queue of tuple pages.
pub fn tuple_fifo_with_config(
    tuple_size: usize,
    config: FifoConfig,
) -> Result<(FifoWriter, FifoReader)> {
    let page = Page::try_new(tuple_size, config.page_size)?;
    if config.capacity == Some(0) {
        return Err(StagepipeError::new("Fifo capacity must be non-zero"));
    }

    let shared = Arc::new(FifoShared {
        tuple_size,
        capacity: config.capacity,
        terminated: AtomicBool::new(false),
        state: Mutex::new(FifoState::default()),
        readable: Condvar::new(),
        writable: Condvar::new(),
    });

    let writer = FifoWriter {
        shared: shared.clone(),
        page,
        closed: false,
    };
    let reader = FifoReader {
        shared,
        finished: false,
    };

    Ok((writer, reader))
}

#[derive(Debug)]
struct FifoShared {
    tuple_size: usize,
    capacity: Option<usize>,
    /// Set by the consumer. Checked by the producer on every write.
    terminated: AtomicBool,
    state: Mutex<FifoState>,
    /// Signaled on page publish, EOF and abort.
    readable: Condvar,
    /// Signaled on page consume and termination.
    writable: Condvar,
}

#[derive(Debug, Default)]
struct FifoState {
    pages: VecDeque<Page>,
    eof: bool,
    aborted: Option<String>,
}

/// Producer end of a tuple fifo.
#[derive(Debug)]
pub struct FifoWriter {
    shared: Arc<FifoShared>,
    /// Page currently being filled.
    page: Page,
    /// Set once EOF was sent or the fifo aborted.
    closed: bool,
}

impl FifoWriter {
    pub fn tuple_size(&self) -> usize {
        self.shared.tuple_size
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Copy a tuple into the fifo.
    pub fn append(&mut self, tuple: &[u8]) -> Result<Outcome> {
        if tuple.len() != self.shared.tuple_size {
            return Err(StagepipeError::new(format!(
                "Expected tuple of size {}, got {}",
                self.shared.tuple_size,
                tuple.len()
            )));
        }
        Ok(self.append_with(|dest| dest.copy_from_slice(tuple)))
    }

    /// Allocate a slot for the next tuple and let `fill` write it.
    ///
    /// Panics if EOF was already sent.
    pub fn append_with<F>(&mut self, fill: F) -> Outcome
    where
        F: FnOnce(&mut [u8]),
    {
        assert!(!self.closed, "append to tuple fifo after EOF");

        if self.is_terminated() {
            self.page.clear();
            return Outcome::Terminated;
        }

        if let Some(slot) = self.page.allocate() {
            fill(slot);
        }

        if self.page.is_full() {
            return self.publish_page();
        }

        Outcome::Continue
    }

    /// Publish the partially filled page, if any.
    pub fn flush(&mut self) -> Outcome {
        if self.is_terminated() {
            self.page.clear();
            return Outcome::Terminated;
        }
        if self.page.is_empty() {
            return Outcome::Continue;
        }
        self.publish_page()
    }

    fn publish_page(&mut self) -> Outcome {
        let mut state = self.shared.state.lock();
        if let Some(capacity) = self.shared.capacity {
            while state.pages.len() >= capacity && !self.is_terminated() {
                self.shared.writable.wait(&mut state);
            }
        }

        if self.is_terminated() {
            self.page.clear();
            return Outcome::Terminated;
        }

        let fresh = self.page.empty_like();
        let page = std::mem::replace(&mut self.page, fresh);
        trace!(tuples = page.tuple_count(), "publishing page");
        state.pages.push_back(page);
        self.shared.readable.notify_one();

        Outcome::Continue
    }

    /// Publish any partial page and mark the end of the stream.
    ///
    /// Only the first call has an effect.
    pub fn send_eof(&mut self) {
        if self.closed {
            return;
        }
        // A terminated consumer doesn't care about the remaining tuples.
        let _ = self.flush();

        let mut state = self.shared.state.lock();
        state.eof = true;
        self.closed = true;
        self.shared.readable.notify_all();
    }

    /// Abort the stream. The consumer's next read returns an error with
    /// `reason`.
    ///
    /// No-op if EOF was already sent.
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.closed {
            return;
        }
        self.page.clear();

        let mut state = self.shared.state.lock();
        state.pages.clear();
        state.aborted = Some(reason.into());
        self.closed = true;
        self.shared.readable.notify_all();
    }
}

impl Drop for FifoWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.abort("Producer dropped before sending EOF");
        }
    }
}

/// Consumer end of a tuple fifo.
#[derive(Debug)]
pub struct FifoReader {
    shared: Arc<FifoShared>,
    /// Set once EOF was observed or the fifo was terminated.
    finished: bool,
}

impl FifoReader {
    pub fn tuple_size(&self) -> usize {
        self.shared.tuple_size
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Take the next page, blocking until one is available.
    ///
    /// Returns None on EOF, and an error if the producer aborted.
    pub fn get_page(&mut self) -> Result<Option<Page>> {
        if self.finished {
            return Ok(None);
        }

        let mut state = self.shared.state.lock();
        loop {
            if let Some(reason) = &state.aborted {
                return Err(StagepipeError::new(format!(
                    "Tuple fifo aborted: {reason}"
                )));
            }
            if let Some(page) = state.pages.pop_front() {
                self.shared.writable.notify_one();
                return Ok(Some(page));
            }
            if state.eof {
                self.finished = true;
                return Ok(None);
            }
            self.shared.readable.wait(&mut state);
        }
    }

    /// Replace `dest` with the next page. Returns false on EOF.
    pub fn copy_page(&mut self, dest: &mut Page) -> Result<bool> {
        match self.get_page()? {
            Some(page) => {
                *dest = page;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tell the producer no more tuples are wanted.
    ///
    /// Queued pages are discarded and a producer blocked on a full fifo is
    /// woken up.
    pub fn terminate(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.shared.terminated.store(true, Ordering::Release);

        let mut state = self.shared.state.lock();
        state.pages.clear();
        self.shared.writable.notify_all();
    }
}

impl Drop for FifoReader {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn read_all(reader: &mut FifoReader) -> Vec<i32> {
        let mut out = Vec::new();
        while let Some(page) = reader.get_page().unwrap() {
            out.extend(page.iter().map(|t| i32::from_le_bytes(t.try_into().unwrap())));
        }
        out
    }

    fn small_config(capacity: Option<usize>) -> FifoConfig {
        FifoConfig {
            page_size: 8,
            capacity,
        }
    }

    #[test]
    fn preserves_order() {
        let (mut writer, mut reader) = tuple_fifo_with_config(4, small_config(None)).unwrap();
        for v in 0..7_i32 {
            assert_eq!(Outcome::Continue, writer.append(&v.to_le_bytes()).unwrap());
        }
        writer.send_eof();

        assert_eq!((0..7).collect::<Vec<_>>(), read_all(&mut reader));
        assert!(reader.get_page().unwrap().is_none());
    }

    #[test]
    fn eof_idempotent() {
        let (mut writer, mut reader) = tuple_fifo_with_config(4, small_config(None)).unwrap();
        writer.append(&1_i32.to_le_bytes()).unwrap();
        writer.send_eof();
        writer.send_eof();

        assert_eq!(vec![1], read_all(&mut reader));
    }

    #[test]
    #[should_panic]
    fn append_after_eof_panics() {
        let (mut writer, _reader) = tuple_fifo(4).unwrap();
        writer.send_eof();
        let _ = writer.append(&1_i32.to_le_bytes());
    }

    #[test]
    fn append_after_terminate() {
        let (mut writer, mut reader) = tuple_fifo_with_config(4, small_config(None)).unwrap();
        writer.append(&1_i32.to_le_bytes()).unwrap();
        reader.terminate();

        assert_eq!(
            Outcome::Terminated,
            writer.append(&2_i32.to_le_bytes()).unwrap()
        );
        assert!(reader.get_page().unwrap().is_none());
    }

    #[test]
    fn reader_drop_terminates() {
        let (mut writer, reader) = tuple_fifo(4).unwrap();
        drop(reader);
        assert_eq!(
            Outcome::Terminated,
            writer.append(&2_i32.to_le_bytes()).unwrap()
        );
    }

    #[test]
    fn writer_drop_aborts() {
        let (mut writer, mut reader) = tuple_fifo_with_config(4, small_config(None)).unwrap();
        writer.append(&1_i32.to_le_bytes()).unwrap();
        drop(writer);

        let err = reader.get_page().unwrap_err();
        assert!(err.get_msg().contains("Producer dropped"));
    }

    #[test]
    fn abort_reason() {
        let (mut writer, mut reader) = tuple_fifo(4).unwrap();
        writer.abort("disk on fire");
        let err = reader.get_page().unwrap_err();
        assert!(err.get_msg().contains("disk on fire"));
    }

    #[test]
    fn bounded_blocks_producer() {
        let (mut writer, mut reader) = tuple_fifo_with_config(4, small_config(Some(1))).unwrap();

        let handle = thread::spawn(move || {
            for v in 0..10_i32 {
                writer.append(&v.to_le_bytes()).unwrap();
            }
            writer.send_eof();
        });

        assert_eq!((0..10).collect::<Vec<_>>(), read_all(&mut reader));
        handle.join().unwrap();
    }

    #[test]
    fn terminate_wakes_blocked_producer() {
        let (mut writer, mut reader) = tuple_fifo_with_config(4, small_config(Some(1))).unwrap();

        let handle = thread::spawn(move || {
            let mut v = 0_i32;
            loop {
                if writer.append(&v.to_le_bytes()).unwrap() == Outcome::Terminated {
                    return v;
                }
                v += 1;
            }
        });

        let first = reader.get_page().unwrap().unwrap();
        assert_eq!(2, first.tuple_count());
        reader.terminate();

        let stopped_at = handle.join().unwrap();
        assert!(stopped_at >= 2);
    }

    #[test]
    fn zero_tuple_size() {
        tuple_fifo(0).unwrap_err();
    }
}
