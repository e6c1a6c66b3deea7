//! Pending-work depth of the encoder.
//!
//! The session only reports how many submitted frames are still waiting for
//! completion; throttling is up to the caller.

use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::WatchStream;

use crate::bus::ExportEvent;

/// Writer side, owned by the protocol handler.
pub struct DepthMonitor {
    depth: watch::Sender<usize>,
    events: broadcast::Sender<ExportEvent>,
}

impl DepthMonitor {
    pub fn new(events: broadcast::Sender<ExportEvent>) -> Self {
        let (depth, _) = watch::channel(0);
        Self { depth, events }
    }

    pub fn current(&self) -> usize {
        *self.depth.borrow()
    }

    pub fn watcher(&self) -> DepthWatcher {
        DepthWatcher {
            rx: self.depth.subscribe(),
        }
    }

    /// One more frame handed to the encoder.
    pub fn submit(&mut self) -> usize {
        let pending = self.current() + 1;
        self.publish(pending);
        pending
    }

    /// `count` frames completed or discarded. Each unit is its own transition.
    pub fn retire(&mut self, count: usize) -> usize {
        for _ in 0..count {
            let current = self.current();
            if current == 0 {
                log::warn!("retiring more frames than were submitted");
                break;
            }
            self.publish(current - 1);
        }
        self.current()
    }

    /// Drops everything pending, e.g. once the encoder is gone.
    pub fn clear(&mut self) {
        let pending = self.current();
        self.retire(pending);
    }

    fn publish(&self, pending: usize) {
        self.depth.send_replace(pending);
        let _ = self.events.send(ExportEvent::DepthChanged { pending });
    }
}

/// Reader side, handed to callers.
#[derive(Clone)]
pub struct DepthWatcher {
    rx: watch::Receiver<usize>,
}

impl DepthWatcher {
    pub fn current(&self) -> usize {
        *self.rx.borrow()
    }

    /// Resolves once the depth is at most `threshold`. Returns the depth seen.
    /// Returns the last known depth if the session is gone.
    pub async fn wait_at_most(&mut self, threshold: usize) -> usize {
        let seen = match self.rx.wait_for(|pending| *pending <= threshold).await {
            Ok(pending) => Some(*pending),
            Err(_) => None,
        };
        seen.unwrap_or_else(|| self.current())
    }

    pub fn stream(&self) -> WatchStream<usize> {
        WatchStream::new(self.rx.clone())
    }
}
