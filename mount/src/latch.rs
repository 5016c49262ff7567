//! A shared one-shot latch: many waiters, one fulfiller.
use parking_lot::Mutex;
use tokio::sync::Notify;

/// The wait/fulfil primitive behind in-flight loads. Every waiter that
/// encounters an in-progress load awaits the same latch; whoever completes
/// the load fulfils it exactly once. Later fulfil calls are ignored.
#[derive(Debug)]
pub struct Latch<T: Clone> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fulfil(&self, value: T) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(value);
            self.notify.notify_waiters();
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub async fn wait(&self) -> T {
        loop {
            // Register before checking the slot so a concurrent fulfil
            // cannot slip between the check and the await.
            let notified = self.notify.notified();
            if let Some(value) = self.slot.lock().clone() {
                return value;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn waiters_all_observe_the_value() {
        let latch = Arc::new(Latch::<u32>::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let latch = latch.clone();
                tokio::spawn(async move { latch.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        latch.fulfil(7);

        for waiter in waiters {
            assert_eq!(7, waiter.await.unwrap());
        }
    }

    #[tokio::test]
    async fn second_fulfil_is_ignored() {
        let latch = Latch::<&'static str>::new();
        latch.fulfil("first");
        latch.fulfil("second");
        assert_eq!("first", latch.wait().await);
    }

    #[tokio::test]
    async fn wait_after_fulfil_returns_immediately() {
        let latch = Latch::<u32>::new();
        latch.fulfil(1);
        assert_eq!(1, latch.wait().await);
        assert!(latch.is_fulfilled());
    }
}
