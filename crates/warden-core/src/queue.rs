//! Drain-once queue of recent events for polling clients.

use crate::event::OutputEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Bounded FIFO of events consumed destructively by [`drain`](Self::drain).
///
/// Fed with every event the [`OutputSink`](crate::sink::OutputSink) records;
/// when full, the oldest entry is evicted first.
#[derive(Debug)]
pub struct CommandOutputQueue {
    entries: Mutex<VecDeque<OutputEvent>>,
    capacity: usize,
}

impl CommandOutputQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, event: OutputEvent) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Atomically take every queued entry, oldest first, leaving the queue empty.
    pub fn drain(&self) -> Vec<OutputEvent> {
        let mut entries = self.entries.lock();
        entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn seed(&self, events: impl IntoIterator<Item = OutputEvent>) {
        for event in events {
            self.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_empties_queue() {
        let queue = CommandOutputQueue::new(10);
        queue.push(OutputEvent::output("line 1"));
        queue.push(OutputEvent::command("list"));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message, "line 1");
        assert_eq!(drained[1].message, "list");

        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let queue = CommandOutputQueue::new(3);
        for i in 1..=5 {
            queue.push(OutputEvent::output(format!("line {}", i)));
        }

        assert_eq!(queue.len(), 3);
        let messages: Vec<_> = queue.drain().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["line 3", "line 4", "line 5"]);
    }

    #[test]
    fn test_concurrent_push_and_drain_loses_nothing() {
        let queue = std::sync::Arc::new(CommandOutputQueue::new(10_000));

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        queue.push(OutputEvent::output(format!("{t}-{i}")));
                    }
                })
            })
            .collect();

        let mut seen = 0;
        for producer in producers {
            producer.join().unwrap();
            seen += queue.drain().len();
        }
        seen += queue.drain().len();

        assert_eq!(seen, 1000);
    }
}
