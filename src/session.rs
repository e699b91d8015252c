use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use crate::errors::SessionError;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Opaque reference to an element inside the current page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle(pub String);

/// A browser-like session driven one query at a time.
#[async_trait]
pub trait BrowserSession: Send {
    async fn open(&mut self, url: &str) -> Result<(), SessionError>;

    async fn find_elements(&mut self, selector: &str) -> Result<Vec<ElementHandle>, SessionError>;

    async fn scroll_into_view(&mut self, element: &ElementHandle) -> Result<(), SessionError>;

    async fn inner_html(&mut self, element: &ElementHandle) -> Result<String, SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;

    async fn find_element(
        &mut self,
        selector: &str,
    ) -> Result<Option<ElementHandle>, SessionError> {
        Ok(self.find_elements(selector).await?.into_iter().next())
    }

    /// Polls for `selector` until it appears or `timeout` elapses. Always
    /// checks at least once.
    async fn wait_for(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Option<ElementHandle>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(element) = self.find_element(selector).await? {
                return Ok(Some(element));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
