#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use mapsweep_lib::config::GeocodeSettings;
use mapsweep_lib::extract::{CHALLENGE, LANDMARK, RESULT, RESULTS_BOX, RESULTS_SENTINEL};
use mapsweep_lib::{
    AppConfig, BrowserSession, ElementHandle, GeocodeError, GeocodeResolver, MunicipalityLookup,
    MunicipalityResponse, SessionError, Telemetry,
};

/// What the fake browser shows after one `open`.
#[derive(Debug, Clone)]
pub struct PageScript {
    pub challenge: bool,
    pub landmark: bool,
    pub results_box: bool,
    pub items: usize,
    /// Items added by each scroll, in order. Exhausted means no growth.
    pub growth: VecDeque<usize>,
    /// The end-of-list sentinel disappears after this many scrolls.
    pub sentinel_for: Option<usize>,
    /// This scroll (1-based) fails with a stale element.
    pub failing_scroll: Option<usize>,
    pub coordinates: bool,
}

impl PageScript {
    pub fn results(items: usize) -> Self {
        Self {
            challenge: false,
            landmark: true,
            results_box: true,
            items,
            growth: VecDeque::new(),
            sentinel_for: None,
            failing_scroll: None,
            coordinates: true,
        }
    }

    pub fn growing(items: usize, growth: &[usize]) -> Self {
        Self {
            growth: growth.iter().copied().collect(),
            ..Self::results(items)
        }
    }

    pub fn challenge() -> Self {
        Self {
            challenge: true,
            ..Self::results(0)
        }
    }

    pub fn never_loads() -> Self {
        Self {
            landmark: false,
            ..Self::results(0)
        }
    }

    pub fn single_place() -> Self {
        Self {
            results_box: false,
            ..Self::results(0)
        }
    }

    pub fn without_coordinates(mut self) -> Self {
        self.coordinates = false;
        self
    }

    pub fn failing_on_scroll(mut self, scroll: usize) -> Self {
        self.failing_scroll = Some(scroll);
        self
    }

    pub fn ending_after(mut self, scrolls: usize) -> Self {
        self.sentinel_for = Some(scrolls);
        self
    }

    fn render(&self) -> String {
        (0..self.items)
            .map(|i| {
                let link = if self.coordinates {
                    format!(
                        r#"<a href="https://maps.test/place/p{i}/data=!3d-6.9{i}!4d107.6{i}?authuser=0"></a>"#
                    )
                } else {
                    format!(r#"<a href="https://maps.test/place/p{i}"></a>"#)
                };
                format!(r#"<div class="Nv2PK">{link}<div class="qBF1Pd">Place {i}</div></div>"#)
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SessionLog {
    pub opened: Vec<String>,
    pub scrolls: usize,
    pub closed: bool,
}

/// Browser session that plays back one `PageScript` per opened URL.
pub struct ScriptedSession {
    scripts: VecDeque<PageScript>,
    page: Option<PageScript>,
    scrolls_on_page: usize,
    log: Arc<Mutex<SessionLog>>,
}

impl ScriptedSession {
    pub fn new(scripts: Vec<PageScript>) -> (Self, Arc<Mutex<SessionLog>>) {
        let log = Arc::new(Mutex::new(SessionLog::default()));
        let session = Self {
            scripts: scripts.into(),
            page: None,
            scrolls_on_page: 0,
            log: log.clone(),
        };
        (session, log)
    }

    fn handles(prefix: &str, count: usize) -> Vec<ElementHandle> {
        (0..count)
            .map(|i| ElementHandle(format!("{prefix}-{i}")))
            .collect()
    }
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn open(&mut self, url: &str) -> Result<(), SessionError> {
        self.log.lock().opened.push(url.to_string());
        self.page = Some(
            self.scripts
                .pop_front()
                .unwrap_or_else(PageScript::never_loads),
        );
        self.scrolls_on_page = 0;
        Ok(())
    }

    async fn find_elements(&mut self, selector: &str) -> Result<Vec<ElementHandle>, SessionError> {
        let Some(page) = &self.page else {
            return Ok(Vec::new());
        };
        let present = match selector {
            s if s == CHALLENGE => page.challenge,
            s if s == LANDMARK => page.landmark,
            s if s == RESULTS_BOX => page.results_box,
            s if s == RESULTS_SENTINEL => page
                .sentinel_for
                .map_or(true, |limit| self.scrolls_on_page < limit),
            s if s == RESULT => return Ok(Self::handles("item", page.items)),
            _ => false,
        };
        Ok(if present {
            Self::handles(selector, 1)
        } else {
            Vec::new()
        })
    }

    async fn scroll_into_view(&mut self, element: &ElementHandle) -> Result<(), SessionError> {
        let page = self.page.as_mut().ok_or(SessionError::Closed)?;
        if page.failing_scroll == Some(self.scrolls_on_page + 1) {
            return Err(SessionError::StaleElement(element.0.clone()));
        }
        page.items += page.growth.pop_front().unwrap_or(0);
        self.scrolls_on_page += 1;
        self.log.lock().scrolls += 1;
        Ok(())
    }

    async fn inner_html(&mut self, _element: &ElementHandle) -> Result<String, SessionError> {
        Ok(self.page.as_ref().map(PageScript::render).unwrap_or_default())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.log.lock().closed = true;
        self.page = None;
        Ok(())
    }
}

/// Reverse lookup that answers every call with the same municipality, or
/// fails every call.
pub struct ScriptedLookup {
    pub city: String,
    pub fail: bool,
    pub calls: Mutex<usize>,
}

impl ScriptedLookup {
    pub fn city(city: &str) -> Arc<Self> {
        Arc::new(Self {
            city: city.to_string(),
            fail: false,
            calls: Mutex::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            city: String::new(),
            fail: true,
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl MunicipalityLookup for ScriptedLookup {
    async fn lookup(
        &self,
        _latitude: &str,
        _longitude: &str,
    ) -> Result<MunicipalityResponse, GeocodeError> {
        *self.calls.lock() += 1;
        if self.fail {
            return Err(GeocodeError::Decode("lookup unavailable".into()));
        }
        Ok(MunicipalityResponse {
            code: "32.73.01.1002".into(),
            province: "Jawa Barat".into(),
            city: self.city.clone(),
            district: "Sukasari".into(),
            village: "Gegerkalong".into(),
            postal: serde_json::json!(40153),
        })
    }
}

/// Defaults with every wait set to zero.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.query.load_timeout = Duration::ZERO;
    config.query.scroll_wait = Duration::ZERO;
    config.query.initial_pause = Duration::ZERO;
    config.query.search_url = "https://maps.test/search".into();
    config.geocode = GeocodeSettings {
        url_template: String::new(),
        timeout: Duration::from_secs(1),
        max_attempts: 1,
        backoff_base: Duration::ZERO,
    };
    config
}

pub fn resolver(lookup: Arc<ScriptedLookup>, config: &AppConfig, telemetry: Telemetry) -> GeocodeResolver {
    GeocodeResolver::with_lookup(lookup, &config.geocode, telemetry)
}
