//! Fixed-capacity accumulator that hands full batches to a sink.

use std::num::NonZeroUsize;

/// Receiver of buffered batches.
pub trait Sink<T> {
    type Error;

    fn flush(&mut self, items: &[T]) -> Result<(), Self::Error>;
}

impl<T, E, F> Sink<T> for F
where
    F: FnMut(&[T]) -> Result<(), E>,
{
    type Error = E;

    fn flush(&mut self, items: &[T]) -> Result<(), E> {
        self(items)
    }
}

/// Collects items and flushes them to the sink once `capacity` is reached.
///
/// The sink always receives the whole batch in one call. Items are cleared
/// only after the sink returns `Ok`; a failing sink leaves them buffered so
/// the caller can inspect, retry or [`discard`](Self::discard) them. The
/// buffer never holds more than `capacity` items.
pub struct FlushingBuffer<T, S> {
    capacity: NonZeroUsize,
    items: Vec<T>,
    sink: S,
}

impl<T, S> FlushingBuffer<T, S>
where
    S: Sink<T>,
{
    pub fn new(capacity: NonZeroUsize, sink: S) -> Self {
        Self {
            capacity,
            items: Vec::with_capacity(capacity.get()),
            sink,
        }
    }

    /// Buffer `item`, flushing once the buffer is full.
    ///
    /// A buffer still full after a failed flush retries that flush first;
    /// if it fails again, `item` is dropped and the error returned.
    pub fn add(&mut self, item: T) -> Result<(), S::Error> {
        if self.items.len() >= self.capacity.get() {
            self.flush()?;
        }
        self.items.push(item);
        if self.items.len() >= self.capacity.get() {
            self.flush()?;
        }
        Ok(())
    }

    /// Append items one by one, so lazy iterators are never materialised.
    pub fn add_multiple<I>(&mut self, items: I) -> Result<(), S::Error>
    where
        I: IntoIterator<Item = T>,
    {
        for item in items {
            self.add(item)?;
        }
        Ok(())
    }

    /// Flush pending items; a no-op when nothing is buffered.
    pub fn flush(&mut self) -> Result<(), S::Error> {
        if self.items.is_empty() {
            return Ok(());
        }
        self.sink.flush(&self.items)?;
        self.items.clear();
        Ok(())
    }

    /// Remove and return the pending items without flushing them.
    pub fn discard(&mut self) -> Vec<T> {
        std::mem::replace(&mut self.items, Vec::with_capacity(self.capacity.get()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn pending(&self) -> &[T] {
        &self.items
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}
