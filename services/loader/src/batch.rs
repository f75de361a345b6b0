//! Fixed-size batching of decoded records.

use std::ops::Deref;

/// Default number of records committed per transaction.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// A sealed, non-empty group of records written in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    records: Vec<T>,
}

impl<T> Batch<T> {
    pub fn into_inner(self) -> Vec<T> {
        self.records
    }
}

impl<T> Deref for Batch<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.records
    }
}

/// Collects records and seals them into batches of at most `max_size`.
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    buffer: Vec<T>,
    max_size: usize,
}

impl<T> BatchAccumulator<T> {
    /// A `max_size` of zero is treated as one.
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            buffer: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Push a record; returns the sealed batch once the buffer is full.
    pub fn push(&mut self, record: T) -> Option<Batch<T>> {
        self.buffer.push(record);
        if self.is_full() {
            self.take_batch()
        } else {
            None
        }
    }

    /// Seal whatever is left at end of stream.
    pub fn finish(mut self) -> Option<Batch<T>> {
        self.take_batch()
    }

    /// Number of records currently buffered
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn take_batch(&mut self) -> Option<Batch<T>> {
        if self.buffer.is_empty() {
            return None;
        }
        let capacity = if self.is_full() { self.max_size } else { 0 };
        let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(capacity));
        Some(Batch { records })
    }
}
