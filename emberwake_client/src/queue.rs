// Inbound queue bridging the network thread and the consumer thread.
//
// The network thread pushes session-control messages as they arrive; the
// consumer (UI) thread pops them in strict FIFO order. Both operations share
// one mutex, held only for the push/pop itself — entries are applied after
// the lock is released so slow UI work never blocks the producer.
//
// The pause flag freezes consumption without stopping reception: while
// paused, `pop` yields nothing but `push` keeps appending. It is set when the
// drain applies a game-start transition, so stale lobby messages are not
// applied to a UI that is about to be torn down, and cleared once the game
// view is installed.

use std::collections::VecDeque;
use std::sync::Mutex;

use emberwake_protocol::message::ServerMessage;

use crate::lock_or_recover;

/// An entry awaiting consumption. `ConnectionLost` is synthesized locally by
/// the network thread when an established connection drops unexpectedly.
#[derive(Debug)]
pub enum Inbound {
    Server(ServerMessage),
    ConnectionLost,
}

struct Inner {
    entries: VecDeque<Inbound>,
    paused: bool,
}

/// Thread-safe FIFO between the network thread and the consumer thread.
pub struct InboundQueue {
    inner: Mutex<Inner>,
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                paused: false,
            }),
        }
    }

    /// Append an entry (network thread).
    pub fn push(&self, entry: Inbound) {
        lock_or_recover(&self.inner).entries.push_back(entry);
    }

    /// Remove the oldest entry (consumer thread). Yields `None` when empty
    /// or paused. The caller applies the entry after this returns, outside
    /// the lock.
    pub fn pop(&self) -> Option<Inbound> {
        let mut inner = lock_or_recover(&self.inner);
        if inner.paused {
            return None;
        }
        inner.entries.pop_front()
    }

    /// Freeze consumption; reception continues.
    pub fn pause(&self) {
        lock_or_recover(&self.inner).paused = true;
    }

    pub fn resume(&self) {
        lock_or_recover(&self.inner).paused = false;
    }

    pub fn is_paused(&self) -> bool {
        lock_or_recover(&self.inner).paused
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(n: u32) -> Inbound {
        Inbound::Server(ServerMessage::Chat {
            from: emberwake_protocol::types::ConnectionId(0),
            name: "Aila".into(),
            text: format!("message {n}"),
        })
    }

    fn text_of(entry: Inbound) -> String {
        match entry {
            Inbound::Server(ServerMessage::Chat { text, .. }) => text,
            other => panic!("expected chat, got {other:?}"),
        }
    }

    #[test]
    fn pop_preserves_fifo_order() {
        let queue = InboundQueue::new();
        for n in 0..5 {
            queue.push(chat(n));
        }
        for n in 0..5 {
            assert_eq!(text_of(queue.pop().unwrap()), format!("message {n}"));
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn pause_freezes_pop_but_not_push() {
        let queue = InboundQueue::new();
        queue.push(chat(0));
        queue.pause();

        assert!(queue.pop().is_none());
        queue.push(chat(1));
        assert_eq!(queue.len(), 2);

        queue.resume();
        assert_eq!(text_of(queue.pop().unwrap()), "message 0");
        assert_eq!(text_of(queue.pop().unwrap()), "message 1");
    }

    #[test]
    fn order_survives_interleaved_pauses() {
        let queue = InboundQueue::new();
        let mut drained = Vec::new();

        queue.push(chat(0));
        queue.push(chat(1));
        drained.push(text_of(queue.pop().unwrap()));

        queue.pause();
        queue.push(chat(2));
        assert!(queue.pop().is_none());
        queue.resume();

        queue.push(chat(3));
        while let Some(entry) = queue.pop() {
            drained.push(text_of(entry));
        }

        let expected: Vec<String> = (0..4).map(|n| format!("message {n}")).collect();
        assert_eq!(drained, expected);
    }

    #[test]
    fn producer_and_consumer_threads_agree_on_order() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let queue = Arc::new(InboundQueue::new());
        let producer_queue = queue.clone();
        let producer = thread::spawn(move || {
            for n in 0..100 {
                producer_queue.push(chat(n));
            }
        });

        let mut seen = Vec::new();
        while seen.len() < 100 {
            match queue.pop() {
                Some(entry) => seen.push(text_of(entry)),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        producer.join().unwrap();

        let expected: Vec<String> = (0..100).map(|n| format!("message {n}")).collect();
        assert_eq!(seen, expected);
    }
}
