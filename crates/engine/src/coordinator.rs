//! Generation / unload mutual exclusion for one loaded model.
//!
//! Two competing roles share a single lock:
//! - `generation`: at most one stream in flight
//! - `unload`: teardown, which waits for the in-flight stream to drain
//!
//! Each role has a FIFO waiter queue. When a generation ends, a queued
//! unload is preferred over queued generations so teardown cannot be
//! starved by a steady stream of new requests.
//!
//! Waking is a handoff: the releaser sets the flag on the waiter's behalf
//! before resolving its channel, so no third party can slip in between.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
struct State {
    generation_active: bool,
    unloading: bool,
    generation_waiters: VecDeque<oneshot::Sender<()>>,
    /// Resolved with `true` for the waiter that performs teardown and
    /// `false` for waiters whose teardown was done by someone else.
    unload_waiters: VecDeque<oneshot::Sender<bool>>,
}

impl State {
    fn has_live_unload_waiter(&self) -> bool {
        self.unload_waiters.iter().any(|tx| !tx.is_closed())
    }

    /// Hand the generation role to the oldest waiter still listening.
    fn wake_generation(&mut self) {
        while let Some(tx) = self.generation_waiters.pop_front() {
            self.generation_active = true;
            if tx.send(()).is_ok() {
                return;
            }
            self.generation_active = false;
        }
    }

    /// Hand the unload role to the oldest waiter still listening.
    fn wake_unload(&mut self) -> bool {
        while let Some(tx) = self.unload_waiters.pop_front() {
            self.unloading = true;
            if tx.send(true).is_ok() {
                return true;
            }
            self.unloading = false;
        }
        false
    }
}

#[derive(Default)]
pub struct ResourceCoordinator {
    state: Mutex<State>,
}

impl ResourceCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for the generation role.
    ///
    /// Suspends while another generation is active, an unload is in
    /// progress, or an unload is queued. The returned permit releases the
    /// role when dropped. Dropping this future while it waits leaves the
    /// coordinator consistent, even if the role was handed over in the
    /// meantime.
    pub async fn acquire_generation(self: &Arc<Self>) -> GenerationPermit {
        loop {
            let rx = {
                let mut st = self.state.lock();
                if !st.generation_active && !st.unloading && !st.has_live_unload_waiter() {
                    st.generation_active = true;
                    return GenerationPermit::new(self.clone());
                }
                let (tx, rx) = oneshot::channel();
                st.generation_waiters.push_back(tx);
                rx
            };
            let mut waiter = Waiter::new(rx, self.clone(), Role::Generation);
            let granted = waiter.wait().await;
            if granted.is_some() {
                return GenerationPermit::new(self.clone());
            }
        }
    }

    /// Clear the generation role and wake exactly one waiter, preferring
    /// unload waiters. No-op when no generation is active.
    pub(crate) fn release_generation(&self) {
        let mut st = self.state.lock();
        if !st.generation_active {
            return;
        }
        st.generation_active = false;
        if !st.wake_unload() {
            st.wake_generation();
        }
    }

    /// Enter the unload role.
    ///
    /// Returns `true` to the single caller that must perform teardown; it
    /// must call [`end_unload`](Self::end_unload) afterwards. Callers that
    /// queue behind an unload already in progress return `false` once it
    /// completes and must not repeat the teardown.
    pub async fn begin_unload_acquiring(self: &Arc<Self>) -> bool {
        let rx = {
            let mut st = self.state.lock();
            if !st.generation_active && !st.unloading {
                st.unloading = true;
                return true;
            }
            let (tx, rx) = oneshot::channel();
            st.unload_waiters.push_back(tx);
            rx
        };
        let mut waiter = Waiter::new(rx, self.clone(), Role::Unload);
        waiter.wait().await.unwrap_or(false)
    }

    /// Finish an unload episode: every queued unload caller learns the
    /// teardown already happened, then one generation waiter is woken.
    pub fn end_unload(&self) {
        let mut st = self.state.lock();
        if !st.unloading {
            return;
        }
        for tx in st.unload_waiters.drain(..) {
            let _ = tx.send(false);
        }
        st.unloading = false;
        st.wake_generation();
    }

    /// RAII form of [`begin_unload_acquiring`](Self::begin_unload_acquiring).
    /// `None` means another caller performed the teardown.
    pub async fn acquire_unload(self: &Arc<Self>) -> Option<UnloadPermit> {
        if self.begin_unload_acquiring().await {
            Some(UnloadPermit {
                coordinator: self.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_generation_active(&self) -> bool {
        self.state.lock().generation_active
    }

    pub fn is_unloading(&self) -> bool {
        self.state.lock().unloading
    }

    /// Queued (generation, unload) waiters still listening.
    pub fn waiting(&self) -> (usize, usize) {
        let st = self.state.lock();
        (
            st.generation_waiters.iter().filter(|tx| !tx.is_closed()).count(),
            st.unload_waiters.iter().filter(|tx| !tx.is_closed()).count(),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Permits and waiters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Holds the generation role until dropped.
pub struct GenerationPermit {
    coordinator: Arc<ResourceCoordinator>,
}

impl GenerationPermit {
    fn new(coordinator: Arc<ResourceCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Release explicitly. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for GenerationPermit {
    fn drop(&mut self) {
        self.coordinator.release_generation();
    }
}

/// Holds the unload role until dropped.
pub struct UnloadPermit {
    coordinator: Arc<ResourceCoordinator>,
}

impl Drop for UnloadPermit {
    fn drop(&mut self) {
        self.coordinator.end_unload();
    }
}

#[derive(Clone, Copy)]
enum Role {
    Generation,
    Unload,
}

trait Grant {
    fn is_grant(&self) -> bool;
}

impl Grant for () {
    fn is_grant(&self) -> bool {
        true
    }
}

impl Grant for bool {
    fn is_grant(&self) -> bool {
        *self
    }
}

/// A queued waiter. If it is dropped after the role was handed to it but
/// before it observed the handoff, the role is passed on.
struct Waiter<T: Grant> {
    rx: oneshot::Receiver<T>,
    coordinator: Arc<ResourceCoordinator>,
    role: Role,
    settled: bool,
}

impl<T: Grant> Waiter<T> {
    fn new(rx: oneshot::Receiver<T>, coordinator: Arc<ResourceCoordinator>, role: Role) -> Self {
        Self {
            rx,
            coordinator,
            role,
            settled: false,
        }
    }

    async fn wait(&mut self) -> Option<T> {
        let value = (&mut self.rx).await.ok();
        self.settled = true;
        value
    }
}

impl<T: Grant> Drop for Waiter<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(value) = self.rx.try_recv() {
            if value.is_grant() {
                match self.role {
                    Role::Generation => self.coordinator.release_generation(),
                    Role::Unload => self.coordinator.end_unload(),
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn permit_drop_releases() {
        let c = ResourceCoordinator::new();
        let permit = c.acquire_generation().await;
        assert!(c.is_generation_active());
        drop(permit);
        assert!(!c.is_generation_active());
    }

    #[tokio::test]
    async fn release_without_generation_is_noop() {
        let c = ResourceCoordinator::new();
        c.release_generation();
        assert!(!c.is_generation_active());
        assert!(c.begin_unload_acquiring().await);
        c.end_unload();
    }

    #[tokio::test]
    async fn second_generation_waits_for_first() {
        let c = ResourceCoordinator::new();
        let first = c.acquire_generation().await;

        let c2 = c.clone();
        let second = tokio::spawn(async move { c2.acquire_generation().await });
        settle().await;
        assert!(!second.is_finished());
        assert_eq!(c.waiting(), (1, 0));

        first.release();
        let permit = second.await.unwrap();
        assert!(c.is_generation_active());
        drop(permit);
        assert!(!c.is_generation_active());
    }

    #[tokio::test]
    async fn unload_waits_for_generation_to_drain() {
        let c = ResourceCoordinator::new();
        let permit = c.acquire_generation().await;

        let c2 = c.clone();
        let unload = tokio::spawn(async move { c2.begin_unload_acquiring().await });
        settle().await;
        assert!(!unload.is_finished());

        drop(permit);
        assert!(unload.await.unwrap());
        assert!(c.is_unloading());
        assert!(!c.is_generation_active());
        c.end_unload();
        assert!(!c.is_unloading());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_the_role() {
        let c = ResourceCoordinator::new();
        let permit = c.acquire_generation().await;

        let c2 = c.clone();
        let abandoned = tokio::spawn(async move { c2.acquire_generation().await });
        settle().await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(permit);
        assert!(!c.is_generation_active());
        let again = tokio::time::timeout(Duration::from_secs(1), c.acquire_generation()).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn unload_permit_ends_episode_on_drop() {
        let c = ResourceCoordinator::new();
        let permit = c.acquire_unload().await.unwrap();
        assert!(c.is_unloading());
        drop(permit);
        assert!(!c.is_unloading());
    }
}
