use serde::Serialize;
use serde_json::json;
use tokio::time::sleep;
use url::form_urlencoded;

use crate::config::{Depth, QuerySettings};
use crate::errors::{NavigationError, SessionError};
use crate::extract::{CHALLENGE, LANDMARK, RESULT, RESULTS_BOX, RESULTS_SENTINEL};
use crate::session::BrowserSession;
use crate::telemetry::Telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DepthReached,
    RetriesExhausted,
    EndOfList,
    /// The session failed mid-scroll; whatever had loaded is kept.
    ScrollFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginationSummary {
    /// Scrolls that grew the list.
    pub scrolls: u32,
    /// Every scroll attempt, successful or not.
    pub attempts: u32,
    pub stop: StopReason,
}

#[derive(Debug, Clone)]
pub struct Navigation {
    pub html: String,
    pub result_count: usize,
    pub pagination: Option<PaginationSummary>,
}

enum ScrollOutcome {
    Grew(usize),
    Stalled(usize),
    EndOfList,
}

/// Drives the one browser session through a query at a time.
pub struct Navigator {
    session: Box<dyn BrowserSession>,
    settings: QuerySettings,
    telemetry: Telemetry,
}

impl Navigator {
    pub fn new(
        session: Box<dyn BrowserSession>,
        settings: QuerySettings,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            session,
            settings,
            telemetry,
        }
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn search_url(&self, query: &str, lang: &str) -> String {
        let query: String = form_urlencoded::byte_serialize(query.as_bytes()).collect();
        let lang: String = form_urlencoded::byte_serialize(lang.as_bytes()).collect();
        format!(
            "{}/{query}?hl={lang}",
            self.settings.search_url.trim_end_matches('/')
        )
    }

    /// Loads the results list for `query` and returns its container HTML
    /// once pagination ends.
    pub async fn fetch(&mut self, query: &str, lang: &str) -> Result<Navigation, NavigationError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(NavigationError::EmptyQuery);
        }
        self.telemetry.info(
            "navigation_started",
            json!({ "query": query, "lang": lang, "depth": self.settings.depth }),
        );

        self.session.open(&self.search_url(query, lang)).await?;
        if !self.settings.initial_pause.is_zero() {
            sleep(self.settings.initial_pause).await;
        }

        if self.session.find_element(CHALLENGE).await?.is_some() {
            self.telemetry
                .error("challenge_detected", json!({ "query": query }));
            return Err(NavigationError::Challenge);
        }

        let timeout = self.settings.load_timeout;
        if self.session.wait_for(LANDMARK, timeout).await?.is_none() {
            self.telemetry.error(
                "load_timeout",
                json!({ "query": query, "timeout_ms": timeout.as_millis() as u64 }),
            );
            return Err(NavigationError::LoadTimeout(timeout));
        }

        if self.session.find_element(RESULTS_BOX).await?.is_none() {
            self.telemetry
                .error("not_a_results_list", json!({ "query": query }));
            return Err(NavigationError::NotAResultsList);
        }

        let pagination = if self.settings.depth.paginates() {
            Some(self.paginate(query).await)
        } else {
            None
        };

        let container = self
            .session
            .find_element(RESULTS_BOX)
            .await?
            .ok_or(NavigationError::NotAResultsList)?;
        let html = self.session.inner_html(&container).await?;
        let result_count = self.count_results().await?;

        self.telemetry.info(
            "navigation_completed",
            json!({ "query": query, "results": result_count, "pagination": pagination }),
        );
        Ok(Navigation {
            html,
            result_count,
            pagination,
        })
    }

    /// Scrolls the results list until the depth is satisfied, the retry
    /// budget runs out, the list reports its end, or a scroll fails. None of
    /// these is an error.
    async fn paginate(&mut self, query: &str) -> PaginationSummary {
        let budget = self.settings.scroll_retries;
        let unbounded = self.settings.depth == Depth::Unbounded;
        let mut scrolls_remaining = match self.settings.depth {
            Depth::Pages(pages) => pages.saturating_sub(1),
            Depth::Unbounded => 0,
        };
        let mut retries_remaining = budget;
        let mut summary = PaginationSummary {
            scrolls: 0,
            attempts: 0,
            stop: StopReason::RetriesExhausted,
        };
        let mut interrupted = None;

        while (unbounded || scrolls_remaining > 0) && retries_remaining > 0 {
            summary.attempts += 1;
            match self.scroll_once().await {
                Err(err) => {
                    self.telemetry.warn(
                        "scroll_failed",
                        json!({ "query": query, "attempt": summary.attempts, "error": err.to_string() }),
                    );
                    interrupted = Some(StopReason::ScrollFailed);
                    break;
                }
                Ok(ScrollOutcome::EndOfList) => {
                    interrupted = Some(StopReason::EndOfList);
                    break;
                }
                Ok(ScrollOutcome::Grew(count)) => {
                    summary.scrolls += 1;
                    retries_remaining = budget;
                    if !unbounded {
                        scrolls_remaining -= 1;
                    }
                    self.telemetry.debug(
                        "scroll_grew",
                        json!({ "results": count, "scrolls_remaining": scrolls_remaining }),
                    );
                }
                Ok(ScrollOutcome::Stalled(count)) => {
                    retries_remaining -= 1;
                    self.telemetry.debug(
                        "scroll_stalled",
                        json!({ "results": count, "retries_remaining": retries_remaining }),
                    );
                }
            }
        }

        summary.stop = match interrupted {
            Some(reason) => reason,
            None if !unbounded && scrolls_remaining == 0 => StopReason::DepthReached,
            None => StopReason::RetriesExhausted,
        };
        if summary.stop == StopReason::RetriesExhausted {
            self.telemetry.warn(
                "pagination_stalled",
                json!({ "query": query, "scrolls": summary.scrolls, "attempts": summary.attempts }),
            );
        }
        summary
    }

    async fn scroll_once(&mut self) -> Result<ScrollOutcome, SessionError> {
        let before = self.count_results().await?;
        if self.session.find_element(RESULTS_SENTINEL).await?.is_none() {
            return Ok(ScrollOutcome::EndOfList);
        }
        let items = self.session.find_elements(RESULT).await?;
        let Some(last) = items.last() else {
            return Ok(ScrollOutcome::EndOfList);
        };
        self.session.scroll_into_view(last).await?;
        sleep(self.settings.scroll_wait).await;

        let after = self.count_results().await?;
        if after > before {
            Ok(ScrollOutcome::Grew(after))
        } else {
            Ok(ScrollOutcome::Stalled(after))
        }
    }

    async fn count_results(&mut self) -> Result<usize, SessionError> {
        Ok(self.session.find_elements(RESULT).await?.len())
    }

    pub async fn close(&mut self) -> Result<(), SessionError> {
        self.session.close().await
    }
}
