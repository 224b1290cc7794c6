//! Pause/resume gate for the change feed.
//!
//! Every local write holds a `Suspension` while it is in flight. The feed only
//! delivers changes while no suspension is held, so overlapping writers cannot
//! resume the feed under each other.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Reference-counted suspension gate. Cheap to clone; clones share the count.
#[derive(Clone)]
pub struct FeedGate {
    depth: Arc<watch::Sender<usize>>,
}

impl Default for FeedGate {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { depth: Arc::new(tx) }
    }
}

impl FeedGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause delivery until the returned guard is released.
    pub fn suspend(&self) -> Suspension {
        self.depth.send_modify(|depth| *depth += 1);
        trace!("Feed suspended (depth {})", self.depth());
        Suspension {
            gate: self.clone(),
            released: false,
        }
    }

    /// Number of suspensions currently held.
    pub fn depth(&self) -> usize {
        *self.depth.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.depth() == 0
    }

    /// Wait until no suspension is held.
    pub async fn wait_open(&self) {
        let mut rx = self.depth.subscribe();
        // The sender lives in self, so wait_for cannot observe a closed channel.
        let _ = rx.wait_for(|depth| *depth == 0).await;
    }

    fn release(&self) {
        self.depth
            .send_modify(|depth| *depth = depth.saturating_sub(1));
        trace!("Feed suspension released (depth {})", self.depth());
    }
}

/// Scoped hold on a `FeedGate`. Released explicitly or on drop.
#[must_use = "dropping a Suspension resumes the feed immediately"]
pub struct Suspension {
    gate: FeedGate,
    released: bool,
}

impl Suspension {
    /// Release this hold. The feed resumes once every hold is released.
    pub fn release(mut self) {
        self.released = true;
        self.gate.release();
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        if !self.released {
            self.gate.release();
        }
    }
}
