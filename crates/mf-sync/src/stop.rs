use std::time::Duration;

use tokio::sync::watch;

/// Cooperative stop flag shared with the control loops.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

impl StopSignal {
    /// A signal nobody can raise.
    pub fn never() -> Self {
        stop_channel().1
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop is requested.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        wait_for_stop(&mut rx).await;
    }

    /// Waits for `duration` unless a stop arrives first. Returns `true` when
    /// stopped.
    pub async fn sleep_or_stop(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        if duration.is_zero() {
            return false;
        }
        let mut rx = self.rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stopped(),
            _ = wait_for_stop(&mut rx) => true,
        }
    }
}

async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stopped| *stopped).await.is_err() {
        // Handle dropped: no stop can ever arrive.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_stop() {
        let (_handle, signal) = stop_channel();
        let started = tokio::time::Instant::now();
        assert!(!signal.sleep_or_stop(Duration::from_secs(60)).await);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_sleep() {
        let (handle, signal) = stop_channel();
        let sleeper = tokio::spawn({
            let signal = signal.clone();
            async move { signal.sleep_or_stop(Duration::from_secs(3600)).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.stop();
        assert!(sleeper.await.unwrap());
        assert!(signal.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn never_signal_still_sleeps() {
        let signal = StopSignal::never();
        assert!(!signal.sleep_or_stop(Duration::from_secs(5)).await);
    }
}
