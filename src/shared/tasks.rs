//! Keyed cancellable timers.
//!
//! Each key owns at most one outstanding timer. Scheduling a key again aborts the
//! previous timer before arming the new one, so retries and debounces never stack.
//! Once a timer fires, its work runs as a detached task: rescheduling the same key
//! from inside that work only affects the next timer, never the running work.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

pub struct TaskSlots<K> {
    slots: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> TaskSlots<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Arm a timer for `key`, cancelling any timer already armed for it.
    pub fn schedule<F>(&self, key: K, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(work);
        });

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = slots.insert(key, handle) {
            prev.abort();
        }
    }

    /// Cancel the timer for `key`. Returns true if one was still pending.
    pub fn cancel(&self, key: &K) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.remove(key) {
            Some(handle) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in slots.drain() {
            handle.abort();
        }
    }

    /// Whether a timer for `key` is armed and has not fired yet.
    pub fn is_scheduled(&self, key: &K) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(key).map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Number of timers that have not fired yet.
    pub fn pending_count(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().filter(|h| !h.is_finished()).count()
    }
}

impl<K> Default for TaskSlots<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for TaskSlots<K> {
    fn drop(&mut self) {
        let slots = self.slots.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in slots.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_cancels_previous() {
        let slots: TaskSlots<String> = TaskSlots::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let fired = fired.clone();
            slots.schedule("g1".to_string(), Duration::from_millis(300), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(slots.is_scheduled(&"g1".to_string()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!slots.is_scheduled(&"g1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let slots: TaskSlots<u32> = TaskSlots::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for key in 0..3 {
            let fired = fired.clone();
            slots.schedule(key, Duration::from_secs(1), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(slots.pending_count(), 3);
        slots.cancel_all();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(slots.pending_count(), 0);
    }
}
