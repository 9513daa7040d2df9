//! Counted in-flight trackers used to sequence shutdown
//!
//! A [`DrainGroup`] counts active operations. Once sealed it refuses new
//! entries, and [`DrainGroup::seal_and_wait`] resolves when the count
//! reaches zero.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DrainState {
    active: usize,
    sealed: bool,
}

/// Returned by [`DrainGroup::enter`] once the group is sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sealed;

#[derive(Debug, Clone)]
pub struct DrainGroup {
    name: &'static str,
    state: Arc<watch::Sender<DrainState>>,
}

impl DrainGroup {
    pub fn new(name: &'static str) -> Self {
        let (state, _rx) = watch::channel(DrainState::default());
        Self {
            name,
            state: Arc::new(state),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register one in-flight operation. Dropping the guard leaves the group.
    pub fn enter(&self) -> Result<DrainGuard, Sealed> {
        let mut entered = false;
        self.state.send_if_modified(|state| {
            if state.sealed {
                return false;
            }
            state.active += 1;
            entered = true;
            true
        });

        if entered {
            Ok(DrainGuard {
                state: self.state.clone(),
            })
        } else {
            Err(Sealed)
        }
    }

    pub fn active(&self) -> usize {
        self.state.borrow().active
    }

    pub fn is_sealed(&self) -> bool {
        self.state.borrow().sealed
    }

    /// Refuse new entries, then wait for every active guard to drop
    pub async fn seal_and_wait(&self) {
        self.state.send_if_modified(|state| {
            let changed = !state.sealed;
            state.sealed = true;
            changed
        });

        let mut rx = self.state.subscribe();
        // sender is owned by self, so the channel cannot close here
        let _ = rx.wait_for(|state| state.active == 0).await;
    }
}

/// Membership in a [`DrainGroup`]
#[derive(Debug)]
pub struct DrainGuard {
    state: Arc<watch::Sender<DrainState>>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.state.send_modify(|state| {
            state.active = state.active.saturating_sub(1);
        });
    }
}
