use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::errors::WizardError;

/// Guards a page against overlapping automation runs
///
/// The latch is held for the duration of an entry point and for a grace period
/// after it returns, so that a page-loaded event fired by our own last action
/// does not start a second run on top of the first.
#[derive(Clone)]
pub struct RunLatch {
    holder: Arc<Mutex<Option<String>>>,
    grace: Duration,
}

impl RunLatch {
    pub fn new(grace: Duration) -> Self {
        Self {
            holder: Arc::new(Mutex::new(None)),
            grace,
        }
    }

    pub fn try_acquire(&self, session_id: &str) -> Result<LatchGuard, WizardError> {
        let mut holder = self.holder.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = holder.as_deref() {
            debug!(held_by = current, "Run latch busy");
            return Err(WizardError::SessionBusy(current.to_string()));
        }
        *holder = Some(session_id.to_string());
        Ok(LatchGuard {
            holder: self.holder.clone(),
            grace: self.grace,
        })
    }

    pub fn is_held(&self) -> bool {
        self.holder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// Releases the latch when dropped, after the grace delay
pub struct LatchGuard {
    holder: Arc<Mutex<Option<String>>>,
    grace: Duration,
}

impl LatchGuard {
    /// Release without the grace delay. The page this run acted on is gone,
    /// so the next page load is not an echo of it.
    pub fn release_now(mut self) {
        self.grace = Duration::ZERO;
    }
}

fn clear(holder: &Mutex<Option<String>>) {
    holder.lock().unwrap_or_else(|e| e.into_inner()).take();
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        let holder = self.holder.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !self.grace.is_zero() => {
                let grace = self.grace;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    clear(&holder);
                });
            }
            _ => clear(&holder),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_is_busy() {
        let latch = RunLatch::new(Duration::ZERO);
        let guard = latch.try_acquire("s1").unwrap();
        assert!(matches!(
            latch.try_acquire("s1"),
            Err(WizardError::SessionBusy(_))
        ));
        drop(guard);
        assert!(latch.try_acquire("s1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_waits_for_grace() {
        let latch = RunLatch::new(Duration::from_secs(2));
        drop(latch.try_acquire("s1").unwrap());
        assert!(latch.is_held());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!latch.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_now_skips_grace() {
        let latch = RunLatch::new(Duration::from_secs(2));
        latch.try_acquire("s1").unwrap().release_now();
        assert!(!latch.is_held());
    }
}
