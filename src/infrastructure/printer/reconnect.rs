//! Jittered reconnect timer for classic Bluetooth sessions.

use crate::domain::settings::ReconnectSettings;
use crate::infrastructure::printer::service::Inbox;
use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Uniform sample from `[min_ms, max_ms)`, or `min_ms` when the window is empty.
pub fn jittered_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..max_ms))
}

struct PendingReconnect {
    generation: u64,
    timer: JoinHandle<()>,
}

/// At most one reconnect timer is pending at a time.
pub(crate) struct ReconnectPolicy {
    enabled: bool,
    generation: u64,
    pending: Option<PendingReconnect>,
    window: ReconnectSettings,
}

impl ReconnectPolicy {
    pub fn new(window: ReconnectSettings) -> Self {
        Self {
            enabled: false,
            generation: 0,
            pending: None,
            window,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.cancel();
        }
    }

    /// Arm a fresh timer, replacing any pending one. Returns the chosen delay.
    pub fn schedule(&mut self, inbox: mpsc::UnboundedSender<Inbox>) -> Duration {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let delay = jittered_delay(self.window.min_delay_ms, self.window.max_delay_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(Inbox::ReconnectDue { generation });
        });
        self.pending = Some(PendingReconnect { generation, timer });
        delay
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Cancelling pending reconnect #{}", pending.generation);
            pending.timer.abort();
        }
    }

    /// Consume the pending timer if `generation` is the one that fired.
    pub fn take_due(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.generation == generation => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..1000 {
            let d = jittered_delay(1000, 5000);
            assert!(d >= Duration::from_millis(1000));
            assert!(d < Duration::from_millis(5000));
        }
    }

    #[test]
    fn test_empty_window_uses_min() {
        assert_eq!(jittered_delay(2000, 2000), Duration::from_millis(2000));
        assert_eq!(jittered_delay(3000, 100), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_with_latest_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut policy = ReconnectPolicy::new(ReconnectSettings::default());
        policy.set_enabled(true);

        policy.schedule(tx.clone());
        let delay = policy.schedule(tx);
        assert!(policy.pending.is_some());

        let start = tokio::time::Instant::now();
        let generation = match rx.recv().await {
            Some(Inbox::ReconnectDue { generation }) => generation,
            other => panic!("unexpected message: {:?}", other),
        };
        assert_eq!(start.elapsed(), delay);
        assert_eq!(generation, 2);
        assert!(policy.take_due(generation));
        assert!(!policy.take_due(generation));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut policy = ReconnectPolicy::new(ReconnectSettings::default());
        policy.set_enabled(true);
        policy.schedule(tx);
        policy.set_enabled(false);
        assert!(policy.pending.is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
