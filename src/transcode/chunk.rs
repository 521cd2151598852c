//! Chunk records.

use tokio::sync::oneshot;

/// One segment of the source timeline, covering
/// `[id * chunk_secs, (id + 1) * chunk_secs)`.
///
/// A chunk exists either because the encoder announced it or because a
/// request created a placeholder for it. `done` flips false to true exactly
/// once per encoder epoch; the waiter list holds one single-use channel per
/// request blocked on this chunk.
#[derive(Debug)]
pub struct Chunk {
    pub id: u32,
    pub done: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Chunk {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            done: false,
            waiters: Vec::new(),
        }
    }

    /// Register a waiter. The receiver resolves when the chunk completes or
    /// the stream is cleared; a waiter that times out simply drops it.
    pub fn subscribe(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    /// Mark the segment file as written and wake every waiter.
    pub fn complete(&mut self) {
        self.done = true;
        self.wake_all();
    }

    /// Wake every waiter without completing the chunk. Used when the owning
    /// stream is cleared so that blocked requests observe the epoch change.
    pub fn wake_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            // A send failure means the request already timed out and dropped
            // its receiver
            let _ = waiter.send(());
        }
    }

    #[cfg(test)]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}
