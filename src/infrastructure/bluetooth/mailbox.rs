//! Single-slot conflated mailbox
//!
//! Native callbacks post into a mailbox without blocking; a later post
//! overwrites an unread value. A receive takes the value out, so the same
//! value is never delivered twice.

use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Store `value`, replacing anything unread. Returns true if a value was
    /// overwritten.
    pub fn post(&self, value: T) -> bool {
        let overwritten = self.lock().replace(value).is_some();
        self.notify.notify_one();
        overwritten
    }

    /// Remove and return the unread value, if any
    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    /// Discard the unread value; returns true if there was one
    pub fn drain(&self) -> bool {
        self.take().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    /// Wait for a value to be available and take it.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(value) = self.take() {
                return value;
            }
            // A post between the check and this await leaves a permit behind,
            // so the wakeup is not lost. Stale permits just loop once more.
            self.notify.notified().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_latest_value_wins() {
        let mailbox = Mailbox::new();
        assert!(!mailbox.post(1));
        assert!(mailbox.post(2));
        assert!(mailbox.post(3));
        assert_eq!(mailbox.recv().await, 3);
        assert!(mailbox.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumed_value_is_not_redelivered() {
        let mailbox = Mailbox::new();
        mailbox.post("first");
        assert_eq!(mailbox.recv().await, "first");

        let second = timeout(Duration::from_millis(100), mailbox.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_value_is_not_delivered() {
        let mailbox = Mailbox::new();
        mailbox.post("stale");
        assert!(mailbox.drain());
        assert!(!mailbox.drain());

        let result = timeout(Duration::from_millis(100), mailbox.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_waiter_is_woken_by_post() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.recv().await })
        };
        tokio::task::yield_now().await;
        mailbox.post(7u32);
        assert_eq!(waiter.await.unwrap(), 7);
    }
}
