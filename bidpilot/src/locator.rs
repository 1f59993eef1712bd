use tracing::{debug, instrument};

use crate::errors::WizardError;
use crate::page::PageDriver;
use crate::selector::Selector;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// Default timeout if none is specified on the locator itself
const DEFAULT_LOCATOR_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A high-level API for waiting on and interacting with page elements
///
/// Every wait is a bounded suspension point: it polls the page at a fixed
/// interval and gives up with `ElementNotFound` once the timeout elapses.
#[derive(Clone)]
pub struct Locator {
    page: Arc<dyn PageDriver>,
    selector: Selector,
    timeout: Duration, // Default timeout for this locator instance
    poll_interval: Duration,
    retries: u32,
}

impl Locator {
    pub fn new(page: Arc<dyn PageDriver>, selector: impl Into<Selector>) -> Self {
        Self {
            page,
            selector: selector.into(),
            timeout: DEFAULT_LOCATOR_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retries: 0,
        }
    }

    /// Set a default timeout for waiting operations on this locator instance.
    /// This timeout is used if no specific timeout is passed to wait methods.
    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Number of extra wait windows granted before `ElementNotFound` is surfaced
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Wait for an element matching the locator to appear, up to the specified timeout.
    /// If no timeout is provided, uses the locator's default timeout.
    #[instrument(level = "debug", skip(self, timeout), fields(selector = %self.selector))]
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), WizardError> {
        let effective_timeout = timeout.unwrap_or(self.timeout);
        let mut attempt = 0;
        loop {
            match self
                .poll_until(effective_timeout, |page, selector| async move {
                    page.exists(&selector).await
                })
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    attempt += 1;
                    debug!(attempt, "Element still missing, retrying wait");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait until the matched element is present, visible and enabled.
    pub async fn wait_clickable(&self, timeout: Option<Duration>) -> Result<(), WizardError> {
        let effective_timeout = timeout.unwrap_or(self.timeout);
        self.poll_until(effective_timeout, |page, selector| async move {
            Ok(page.exists(&selector).await?
                && page.is_visible(&selector).await?
                && page.is_enabled(&selector).await?)
        })
        .await
    }

    /// Wait for the element to leave the document.
    pub async fn wait_gone(&self, timeout: Option<Duration>) -> Result<(), WizardError> {
        let effective_timeout = timeout.unwrap_or(self.timeout);
        self.poll_until(effective_timeout, |page, selector| async move {
            Ok(!page.exists(&selector).await?)
        })
        .await
    }

    /// Single non-waiting presence check
    pub async fn is_present(&self) -> Result<bool, WizardError> {
        self.page.exists(&self.selector).await
    }

    pub async fn click(&self) -> Result<(), WizardError> {
        self.wait(None).await?;
        self.page.click(&self.selector).await
    }

    pub async fn fill(&self, value: &str) -> Result<(), WizardError> {
        self.wait(None).await?;
        self.page.set_value(&self.selector, value).await
    }

    pub async fn text(&self) -> Result<String, WizardError> {
        self.wait(None).await?;
        self.page.text(&self.selector).await
    }

    async fn poll_until<F, Fut>(&self, timeout: Duration, mut check: F) -> Result<(), WizardError>
    where
        F: FnMut(Arc<dyn PageDriver>, Selector) -> Fut,
        Fut: std::future::Future<Output = Result<bool, WizardError>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            // Transient read errors count as "not yet"
            match check(self.page.clone(), self.selector.clone()).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => debug!(error = %e, "Poll read failed"),
            }
            if Instant::now() >= deadline {
                return Err(WizardError::ElementNotFound(format!(
                    "{} (waited {:?})",
                    self.selector, timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedWizard;

    #[tokio::test]
    async fn test_wait_times_out_with_element_not_found() {
        let wizard = Arc::new(SimulatedWizard::builder().build());
        let locator = Locator::new(wizard, "#does_not_exist")
            .set_default_timeout(Duration::from_millis(20))
            .poll_every(Duration::from_millis(5))
            .with_retries(2);
        match locator.wait(None).await {
            Err(WizardError::ElementNotFound(msg)) => assert!(msg.contains("does_not_exist")),
            other => panic!("Expected ElementNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_succeeds_for_present_element() {
        let wizard = Arc::new(SimulatedWizard::builder().build());
        let locator = Locator::new(wizard, "#ctl00_btnNext")
            .set_default_timeout(Duration::from_millis(20))
            .poll_every(Duration::from_millis(5));
        assert!(locator.wait(None).await.is_ok());
    }
}
