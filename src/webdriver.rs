use async_trait::async_trait;
use fantoccini::elements::Element;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{Browser, WebClientSettings};
use crate::errors::SessionError;
use crate::session::{BrowserSession, ElementHandle};

const SCROLL_SCRIPT: &str = "arguments[0].scrollIntoView(true);";

/// Browser session driven through a WebDriver endpoint (geckodriver,
/// chromedriver, or a Selenium server).
///
/// Handles stay valid until the next element lookup.
pub struct WebDriverSession {
    client: Option<Client>,
    lookup: u64,
    elements: Vec<Element>,
}

impl WebDriverSession {
    pub async fn start(settings: &WebClientSettings) -> Result<Self, SessionError> {
        let mut builder = ClientBuilder::native();
        builder.capabilities(capabilities(settings.browser, settings.show));
        let client = builder.connect(&settings.webdriver_url).await?;
        debug!(browser = ?settings.browser, show = settings.show, "webdriver session started");
        Ok(Self {
            client: Some(client),
            lookup: 0,
            elements: Vec::new(),
        })
    }

    fn client(&self) -> Result<&Client, SessionError> {
        self.client.as_ref().ok_or(SessionError::Closed)
    }

    fn remember(&mut self, elements: Vec<Element>) -> Vec<ElementHandle> {
        self.lookup += 1;
        let handles = (0..elements.len())
            .map(|i| ElementHandle(format!("{}:{i}", self.lookup)))
            .collect();
        self.elements = elements;
        handles
    }

    fn element(&self, handle: &ElementHandle) -> Result<&Element, SessionError> {
        let stale = || SessionError::StaleElement(handle.0.clone());
        let (lookup, index) = handle.0.split_once(':').ok_or_else(stale)?;
        if lookup.parse::<u64>().ok() != Some(self.lookup) {
            return Err(stale());
        }
        index
            .parse::<usize>()
            .ok()
            .and_then(|i| self.elements.get(i))
            .ok_or_else(stale)
    }
}

fn capabilities(browser: Browser, show: bool) -> Map<String, Value> {
    let mut caps = Map::new();
    match browser {
        Browser::Firefox => {
            let args: Vec<&str> = if show { vec![] } else { vec!["-headless"] };
            caps.insert("browserName".into(), json!("firefox"));
            caps.insert("moz:firefoxOptions".into(), json!({ "args": args }));
        }
        Browser::Chrome => {
            let args: Vec<&str> = if show { vec![] } else { vec!["--headless=new"] };
            caps.insert("browserName".into(), json!("chrome"));
            caps.insert(
                "goog:chromeOptions".into(),
                json!({ "args": args, "excludeSwitches": ["enable-automation"] }),
            );
        }
    }
    caps
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn open(&mut self, url: &str) -> Result<(), SessionError> {
        self.client()?.goto(url).await?;
        Ok(())
    }

    async fn find_elements(&mut self, selector: &str) -> Result<Vec<ElementHandle>, SessionError> {
        let found = self.client()?.find_all(Locator::Css(selector)).await?;
        Ok(self.remember(found))
    }

    async fn scroll_into_view(&mut self, element: &ElementHandle) -> Result<(), SessionError> {
        let target = serde_json::to_value(self.element(element)?)?;
        self.client()?.execute(SCROLL_SCRIPT, vec![target]).await?;
        Ok(())
    }

    async fn inner_html(&mut self, element: &ElementHandle) -> Result<String, SessionError> {
        Ok(self.element(element)?.html(true).await?)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.elements.clear();
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        client.close().await.map_err(|err| {
            warn!(?err, "failed to end webdriver session");
            SessionError::from(err)
        })
    }
}
