//! Cross-thread hand-off to the simulation thread
//!
//! Background threads post with [`EventSender::send`]; the simulation thread
//! drains the whole queue once per tick. Events are delivered in arrival
//! order and are never merged or dropped.

use std::path::PathBuf;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// A package finished rebuilding and can be loaded
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    /// Package file that changed
    pub package: PathBuf,
    /// Position in the stream of events raised by one producer
    pub sequence: u64,
    pub raised_at: Instant,
}

/// A compiled shader binary changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderEvent {
    /// Shader name without directory or extension
    pub shader: String,
}

/// Producer half, cheap to clone
#[derive(Debug)]
pub struct EventSender<T> {
    tx: Sender<T>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> EventSender<T> {
    /// Post an event without blocking. Returns false once the queue is gone.
    pub fn send(&self, event: T) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Single-consumer FIFO queue
#[derive(Debug)]
pub struct EventQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> EventSender<T> {
        EventSender { tx: self.tx.clone() }
    }

    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Every event queued so far, oldest first
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        for i in 0..5u32 {
            assert!(sender.send(i));
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.drain(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicates_are_kept() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        sender.send(ShaderEvent { shader: "fs_forward".into() });
        sender.send(ShaderEvent { shader: "fs_forward".into() });
        assert_eq!(queue.drain().len(), 2);
    }

    #[test]
    fn test_many_producers() {
        let queue = EventQueue::new();
        let handles: Vec<_> = (0..4u64)
            .map(|producer| {
                let sender = queue.sender();
                thread::spawn(move || {
                    for i in 0..100u64 {
                        sender.send(producer * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("producer thread");
        }

        let events = queue.drain();
        assert_eq!(events.len(), 400);
        for producer in 0..4u64 {
            let own: Vec<u64> = events.iter().copied().filter(|e| e / 1000 == producer).collect();
            assert!(own.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
