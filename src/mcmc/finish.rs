use std::time::Duration;

use tokio::sync::watch;

/// Raised once by the side that waits for the sampler to exit.
#[derive(Debug, Clone)]
pub struct FinishTrigger {
    tx: watch::Sender<bool>,
}

/// Polled by the sync loop to learn that the sampler has exited.
#[derive(Debug, Clone)]
pub struct FinishSignal {
    rx: watch::Receiver<bool>,
}

pub fn finish_channel() -> (FinishTrigger, FinishSignal) {
    let (tx, rx) = watch::channel(false);
    (FinishTrigger { tx }, FinishSignal { rx })
}

impl FinishTrigger {
    pub fn finish(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> FinishSignal {
        FinishSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl FinishSignal {
    /// Non-blocking check.
    pub fn is_finished(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration`, returning early when the signal is raised.
    /// Returns whether the signal is set on wake.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_finished() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            // a dropped trigger can never fire; wait out the full interval
            changed = self.rx.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(duration).await;
                }
            }
        }
        self.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn signal_is_visible_to_every_receiver() {
        let (trigger, signal) = finish_channel();
        let other = trigger.signal();
        assert!(!signal.is_finished());
        trigger.finish();
        assert!(signal.is_finished());
        assert!(other.is_finished());
    }

    #[tokio::test]
    async fn sleep_wakes_early_when_finished() {
        let (trigger, mut signal) = finish_channel();
        let started = Instant::now();
        let handle = tokio::spawn(async move { signal.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.finish();
        assert!(handle.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn sleep_runs_full_interval_without_signal() {
        let (_trigger, mut signal) = finish_channel();
        assert!(!signal.sleep(Duration::from_millis(10)).await);
    }
}
