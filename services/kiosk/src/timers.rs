//! Engine timers, backed by a `DelayQueue`. At most one instance of each [`Timer`] is
//! armed; scheduling it again restarts its countdown.

use kiosk_core::engine::Timer;
use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;
use tokio_util::time::{DelayQueue, delay_queue::Key};

#[derive(Default)]
pub struct Timers {
    queue: DelayQueue<Timer>,
    keys: HashMap<Timer, Key>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, timer: Timer, after: Duration) {
        match self.keys.get(&timer) {
            Some(key) => self.queue.reset(key, after),
            None => {
                let key = self.queue.insert(timer.clone(), after);
                self.keys.insert(timer, key);
            }
        }
    }

    pub fn cancel(&mut self, timer: &Timer) -> bool {
        match self.keys.remove(timer) {
            Some(key) => {
                self.queue.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, timer: &Timer) -> bool {
        self.keys.contains_key(timer)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.keys.clear();
    }

    /// Waits for the next expiry. Resolves to `None` at once when nothing is armed.
    pub async fn next(&mut self) -> Option<Timer> {
        let expired = poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let timer = expired.into_inner();
        self.keys.remove(&timer);
        Some(timer)
    }
}
