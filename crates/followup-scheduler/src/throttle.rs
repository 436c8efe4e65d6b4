//! Delivery throttle: sliding-window cap on outbound sends, shared by every
//! worker and the sweeper. Independent of worker concurrency.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct DeliveryThrottle {
    max_per_window: usize,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl DeliveryThrottle {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window: max_per_window.max(1) as usize,
            window,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// `n` deliveries per rolling minute.
    pub fn per_minute(n: u32) -> Self {
        Self::new(n, Duration::from_secs(60))
    }

    /// Wait for a free slot, then take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut sent = self.sent.lock().await;
                let now = Instant::now();
                while sent
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    sent.pop_front();
                }
                if sent.len() < self.max_per_window {
                    sent.push_back(now);
                    return;
                }
                match sent.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };
            tracing::debug!("⏳ Delivery throttled for {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Sends recorded in the current window.
    pub async fn in_window(&self) -> usize {
        let sent = self.sent.lock().await;
        let now = Instant::now();
        sent.iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}
