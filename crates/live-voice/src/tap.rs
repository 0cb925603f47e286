//! Live sample taps for an external level analyser.
//!
//! The engine never computes levels itself; it only publishes the blocks it
//! captures and renders. Publishing is skipped entirely while nobody listens.

use std::sync::Arc;
use tokio::sync::broadcast;

const TAP_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct AudioTap {
    tx: broadcast::Sender<Arc<[f32]>>,
}

impl Default for AudioTap {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioTap {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(TAP_CAPACITY);
        Self { tx }
    }

    /// Lagging subscribers lose the oldest blocks rather than stalling audio.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<[f32]>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, samples: &[f32]) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let _ = self.tx.send(Arc::from(samples));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_see_published_blocks() {
        let tap = AudioTap::new();
        let mut rx = tap.subscribe();
        tap.publish(&[0.1, 0.2]);
        let block = rx.try_recv().unwrap();
        assert_eq!(&block[..], &[0.1, 0.2]);
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        AudioTap::new().publish(&[0.0; 16]);
    }
}
