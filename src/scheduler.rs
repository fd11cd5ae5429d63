//! Cancellable delayed tasks.
//!
//! A [`TimerSlot`] owns at most one outstanding timer. Scheduling into a slot
//! cancels whatever was pending there first, so timers never stack. Each
//! scheduled timer is a tokio task that waits on its delay and a
//! [`CancellationToken`]; cancellation only stops the wait, never work that
//! has already started.
//!
//! The connection manager keeps one slot per purpose: debounce, reconnect
//! and liveness.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct SlotState {
    generation: u64,
    active: Option<(u64, CancellationToken)>,
}

/// Slot holding at most one pending timer.
///
/// Clones share the same slot.
#[derive(Debug, Clone)]
pub struct TimerSlot {
    name: &'static str,
    state: Arc<Mutex<SlotState>>,
}

impl TimerSlot {
    /// Create an empty slot. `name` only appears in logs.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(SlotState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel the pending timer (if any) and arm a fresh token.
    fn arm(&self) -> (u64, CancellationToken) {
        let mut state = self.lock();
        state.generation += 1;
        let generation = state.generation;
        let token = CancellationToken::new();
        if let Some((_, old)) = state.active.replace((generation, token.clone())) {
            old.cancel();
            log::debug!("[Scheduler] {} timer replaced", self.name);
        }
        (generation, token)
    }

    /// Clear the slot if it still belongs to `generation`.
    fn disarm(&self, generation: u64) {
        let mut state = self.lock();
        if state.active.as_ref().is_some_and(|(g, _)| *g == generation) {
            state.active = None;
        }
    }

    /// Run `task` once after `delay`, replacing any pending timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (generation, token) = self.arm();
        let slot = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            // Fired: from here on the task runs to completion.
            slot.disarm(generation);
            task.await;
        });
    }

    /// Run `tick` after `delay` and then every `interval`, replacing any
    /// pending timer.
    ///
    /// The loop ends when the slot is cancelled or replaced, or when `tick`
    /// returns [`ControlFlow::Break`].
    pub fn schedule_repeating<F, Fut>(&self, delay: Duration, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send,
    {
        let (generation, token) = self.arm();
        let slot = self.clone();
        tokio::spawn(async move {
            let mut wait = delay;
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(wait) => {}
                }
                if tick().await.is_break() {
                    slot.disarm(generation);
                    return;
                }
                wait = interval;
            }
        });
    }

    /// Cancel the pending timer. Returns `true` if one was pending.
    pub fn cancel(&self) -> bool {
        match self.lock().active.take() {
            Some((_, token)) => {
                token.cancel();
                log::debug!("[Scheduler] {} timer cancelled", self.name);
                true
            }
            None => false,
        }
    }

    /// Returns `true` if a timer is waiting (or a repeating timer is live).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.lock().active.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_after_delay() {
        let slot = TimerSlot::new("test");
        let hits = counter();
        let h = Arc::clone(&hits);
        slot.schedule(Duration::from_millis(500), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(slot.is_pending());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!slot.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_timer() {
        let slot = TimerSlot::new("test");
        let first = counter();
        let second = counter();

        let f = Arc::clone(&first);
        slot.schedule(Duration::from_millis(500), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let s = Arc::clone(&second);
        slot.schedule(Duration::from_millis(500), async move {
            s.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_timer() {
        let slot = TimerSlot::new("test");
        let hits = counter();
        let h = Arc::clone(&hits);
        slot.schedule(Duration::from_secs(30), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(slot.cancel());
        assert!(!slot.cancel());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_runs_until_cancelled() {
        let slot = TimerSlot::new("test");
        let hits = counter();
        let h = Arc::clone(&hits);
        slot.schedule_repeating(Duration::from_secs(1), Duration::from_secs(10), move || {
            let h = Arc::clone(&h);
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });

        // Ticks at 1s, 11s, 21s.
        tokio::time::sleep(Duration::from_millis(21_500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        slot.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_break_clears_slot() {
        let slot = TimerSlot::new("test");
        slot.schedule_repeating(Duration::from_secs(1), Duration::from_secs(1), || async {
            ControlFlow::Break(())
        });
        assert!(slot.is_pending());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!slot.is_pending());
    }
}
