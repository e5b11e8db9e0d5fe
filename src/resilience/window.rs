//! Rolling time window of fixed-width buckets.
//!
//! Each bucket remembers the epoch it was last written in; a bucket whose
//! epoch fell out of the window reads as empty and is reset lazily on write.
//! Not synchronized: owners keep it behind their own short critical section.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Slot<T> {
    epoch: u64,
    value: T,
}

#[derive(Debug)]
pub struct Window<T> {
    slots: Vec<Slot<T>>,
    width_ms: u64,
    origin: Instant,
}

impl<T: Default + Clone> Window<T> {
    /// A window spanning `span`, split into `buckets` buckets.
    pub fn new(span: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        let width_ms = (span.as_millis() as u64 / buckets as u64).max(1);
        Self {
            slots: vec![
                Slot {
                    epoch: u64::MAX,
                    value: T::default(),
                };
                buckets
            ],
            width_ms,
            origin: Instant::now(),
        }
    }

    pub fn bucket_width(&self) -> Duration {
        Duration::from_millis(self.width_ms)
    }

    fn epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_millis() as u64 / self.width_ms
    }

    fn live(&self, slot_epoch: u64, current: u64) -> bool {
        slot_epoch != u64::MAX && slot_epoch <= current && current - slot_epoch < self.slots.len() as u64
    }

    /// The bucket `now` falls into, cleared if it still holds an old epoch.
    pub fn current(&mut self, now: Instant) -> &mut T {
        let epoch = self.epoch(now);
        let index = (epoch % self.slots.len() as u64) as usize;
        let slot = &mut self.slots[index];
        if slot.epoch != epoch {
            slot.epoch = epoch;
            slot.value = T::default();
        }
        &mut slot.value
    }

    /// Buckets inside the window, including the one being filled.
    pub fn buckets(&self, now: Instant) -> impl Iterator<Item = &T> {
        let current = self.epoch(now);
        self.slots
            .iter()
            .filter(move |s| self.live(s.epoch, current))
            .map(|s| &s.value)
    }

    /// Buckets inside the window that can no longer change.
    pub fn completed(&self, now: Instant) -> impl Iterator<Item = &T> {
        let current = self.epoch(now);
        self.slots
            .iter()
            .filter(move |s| s.epoch != current && self.live(s.epoch, current))
            .map(|s| &s.value)
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.epoch = u64::MAX;
            slot.value = T::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_buckets_expire() {
        let mut window: Window<u32> = Window::new(Duration::from_millis(100), 4);
        assert_eq!(window.bucket_width(), Duration::from_millis(25));

        *window.current(Instant::now()) += 3;
        time::advance(Duration::from_millis(30)).await;
        *window.current(Instant::now()) += 2;

        let now = Instant::now();
        assert_eq!(window.buckets(now).sum::<u32>(), 5);
        assert_eq!(window.completed(now).sum::<u32>(), 3);

        // First bucket slides out, second one is still in.
        time::advance(Duration::from_millis(80)).await;
        assert_eq!(window.buckets(Instant::now()).sum::<u32>(), 2);

        time::advance(Duration::from_millis(200)).await;
        assert_eq!(window.buckets(Instant::now()).count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_reuse_clears_old_value() {
        let mut window: Window<u32> = Window::new(Duration::from_millis(40), 4);
        *window.current(Instant::now()) += 7;
        time::advance(Duration::from_millis(40)).await;
        // Same slot index, next lap.
        assert_eq!(*window.current(Instant::now()), 0);

        *window.current(Instant::now()) += 1;
        window.reset();
        assert_eq!(window.buckets(Instant::now()).count(), 0);
    }
}
