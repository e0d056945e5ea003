//! Callback dispatcher.
//!
//! Three independent buffered channels (inserted, updated, inserted or
//! updated) deliver affected records to observers in batches.

use crate::buffer::{FlushingBuffer, Sink};
use crate::record::Record;
use std::convert::Infallible;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Observer receiving a batch of affected records.
pub type RecordsCallback = Arc<dyn Fn(&[Record]) + Send + Sync>;

/// Registered observers per channel.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub inserted: Vec<RecordsCallback>,
    pub updated: Vec<RecordsCallback>,
    pub inserted_or_updated: Vec<RecordsCallback>,
}

impl Callbacks {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.inserted_or_updated.is_empty()
    }
}

/// Sink invoking every observer of one channel with the whole batch.
pub(crate) struct ObserverSink {
    observers: Vec<RecordsCallback>,
}

impl Sink<Record> for ObserverSink {
    type Error = Infallible;

    fn flush(&mut self, items: &[Record]) -> Result<(), Infallible> {
        for observer in &self.observers {
            observer(items);
        }
        Ok(())
    }
}

type Channel = FlushingBuffer<Record, ObserverSink>;

fn channel(capacity: NonZeroUsize, observers: &[RecordsCallback]) -> Option<Channel> {
    if observers.is_empty() {
        return None;
    }
    Some(FlushingBuffer::new(
        capacity,
        ObserverSink {
            observers: observers.to_vec(),
        },
    ))
}

fn push_all(channel: &mut Option<Channel>, records: &[Record]) {
    if let Some(channel) = channel {
        let Ok(()) = channel.add_multiple(records.iter().cloned());
    }
}

fn flush(channel: &mut Option<Channel>) {
    if let Some(channel) = channel {
        let Ok(()) = channel.flush();
    }
}

/// Buffered delivery of affected records for one prepared import.
///
/// Channels without observers are not allocated, so records are not
/// retained for nobody.
pub(crate) struct CallbackDispatcher {
    inserted: Option<Channel>,
    updated: Option<Channel>,
    inserted_or_updated: Option<Channel>,
}

impl CallbackDispatcher {
    pub(crate) fn new(capacity: NonZeroUsize, callbacks: &Callbacks) -> Self {
        Self {
            inserted: channel(capacity, &callbacks.inserted),
            updated: channel(capacity, &callbacks.updated),
            inserted_or_updated: channel(capacity, &callbacks.inserted_or_updated),
        }
    }

    /// Enqueue the affected records of one committed chunk.
    pub(crate) fn dispatch(&mut self, inserted: &[Record], updated: &[Record]) {
        push_all(&mut self.inserted, inserted);
        push_all(&mut self.updated, updated);
        push_all(&mut self.inserted_or_updated, inserted);
        push_all(&mut self.inserted_or_updated, updated);
    }

    /// Deliver everything still buffered.
    pub(crate) fn flush_all(&mut self) {
        flush(&mut self.inserted);
        flush(&mut self.updated);
        flush(&mut self.inserted_or_updated);
    }

    pub(crate) fn pending(&self) -> usize {
        [&self.inserted, &self.updated, &self.inserted_or_updated]
            .into_iter()
            .flatten()
            .map(FlushingBuffer::len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use parking_lot::Mutex;

    fn recorder() -> (RecordsCallback, Arc<Mutex<Vec<usize>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let callback: RecordsCallback = Arc::new(move |records: &[Record]| sink.lock().push(records.len()));
        (callback, calls)
    }

    #[test]
    fn test_channels_batch_independently() {
        let (on_inserted, inserted_calls) = recorder();
        let (on_updated, updated_calls) = recorder();
        let (on_any, any_calls) = recorder();
        let callbacks = Callbacks {
            inserted: vec![on_inserted],
            updated: vec![on_updated],
            inserted_or_updated: vec![on_any],
        };

        let mut dispatcher = CallbackDispatcher::new(NonZeroUsize::new(2).unwrap(), &callbacks);
        dispatcher.dispatch(&[record! { "a" => 1 }], &[record! { "a" => 2 }]);
        assert_eq!(*any_calls.lock(), vec![2]);
        assert!(inserted_calls.lock().is_empty());

        dispatcher.dispatch(&[record! { "a" => 3 }], &[]);
        assert_eq!(*inserted_calls.lock(), vec![2]);

        dispatcher.flush_all();
        assert_eq!(*updated_calls.lock(), vec![1]);
        assert_eq!(*any_calls.lock(), vec![2, 1]);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_channels_without_observers_hold_nothing() {
        let (on_inserted, _) = recorder();
        let callbacks = Callbacks {
            inserted: vec![on_inserted],
            ..Callbacks::default()
        };
        let mut dispatcher = CallbackDispatcher::new(NonZeroUsize::new(10).unwrap(), &callbacks);
        dispatcher.dispatch(&[record! { "a" => 1 }], &[record! { "a" => 2 }]);
        assert_eq!(dispatcher.pending(), 1);
    }

    #[test]
    fn test_every_observer_of_a_channel_is_called() {
        let (first, first_calls) = recorder();
        let (second, second_calls) = recorder();
        let callbacks = Callbacks {
            updated: vec![first, second],
            ..Callbacks::default()
        };
        let mut dispatcher = CallbackDispatcher::new(NonZeroUsize::new(10).unwrap(), &callbacks);
        dispatcher.dispatch(&[], &[record! { "a" => 1 }]);
        dispatcher.flush_all();
        assert_eq!(*first_calls.lock(), vec![1]);
        assert_eq!(*second_calls.lock(), vec![1]);
    }
}
