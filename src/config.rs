use std::time::Duration;
use std::{env, io};

use chrono::Local;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const DEFAULT_SEARCH_URL: &str = "https://www.google.com/maps/search";
const DEFAULT_GEOCODE_URL: &str =
    "http://127.0.0.1:8080/reverse?lat={latitude}&lon={longitude}";
const DEFAULT_WEBDRIVER_URL: &str = "http://127.0.0.1:4444";

/// Pagination depth: how many result "pages" to load by scrolling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Depth {
    Unbounded,
    Pages(u32),
}

impl Depth {
    /// `0` means unbounded, `1` means the first page only.
    pub fn from_count(count: u32) -> Self {
        if count == 0 {
            Depth::Unbounded
        } else {
            Depth::Pages(count)
        }
    }

    pub fn paginates(&self) -> bool {
        !matches!(self, Depth::Pages(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Browser {
    Firefox,
    Chrome,
}

impl Browser {
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "firefox" => Ok(Browser::Firefox),
            "chrome" => Ok(Browser::Chrome),
            other => Err(AppError::Config(format!(
                "web client \"{other}\" does not exist or is unsupported"
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QuerySettings {
    pub lang: String,
    pub depth: Depth,
    pub load_timeout: Duration,
    pub initial_pause: Duration,
    pub scroll_wait: Duration,
    pub scroll_retries: u32,
    pub search_url: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct GeocodeSettings {
    pub url_template: String,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PostprocSettings {
    pub filter_by_city: bool,
    pub flatten: bool,
    pub convert_ascii: bool,
    pub replace_newline: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct FileIoSettings {
    pub autosave_every: usize,
    pub keep_autosave: bool,
    pub output_indent: usize,
    pub event_log_path: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WebClientSettings {
    pub webdriver_url: String,
    pub browser: Browser,
    pub show: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct AppConfig {
    pub query: QuerySettings,
    pub geocode: GeocodeSettings,
    pub postproc: PostprocSettings,
    pub fileio: FileIoSettings,
    pub webclient: WebClientSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            query: QuerySettings {
                lang: "id".into(),
                depth: Depth::Pages(3),
                load_timeout: Duration::from_millis(15_000),
                initial_pause: Duration::ZERO,
                scroll_wait: Duration::from_millis(2_500),
                scroll_retries: 5,
                search_url: DEFAULT_SEARCH_URL.into(),
            },
            geocode: GeocodeSettings {
                url_template: DEFAULT_GEOCODE_URL.into(),
                timeout: Duration::from_millis(4_000),
                max_attempts: 5,
                backoff_base: Duration::from_millis(250),
            },
            postproc: PostprocSettings {
                filter_by_city: true,
                ..PostprocSettings::default()
            },
            fileio: FileIoSettings {
                autosave_every: 1,
                keep_autosave: false,
                output_indent: 2,
                event_log_path: None,
            },
            webclient: WebClientSettings {
                webdriver_url: DEFAULT_WEBDRIVER_URL.into(),
                browser: Browser::Firefox,
                show: false,
            },
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            query: QuerySettings {
                lang: env::var("QUERY_LANG")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or(defaults.query.lang),
                depth: Depth::from_count(parse_u32("QUERY_DEPTH", 3)),
                load_timeout: parse_millis("LOAD_TIMEOUT_MS", defaults.query.load_timeout),
                initial_pause: parse_millis("INITIAL_PAUSE_MS", defaults.query.initial_pause),
                scroll_wait: parse_millis("SCROLL_WAIT_MS", defaults.query.scroll_wait),
                scroll_retries: parse_u32("SCROLL_RETRIES", defaults.query.scroll_retries),
                search_url: env::var("MAPS_SEARCH_URL").unwrap_or(defaults.query.search_url),
            },
            geocode: GeocodeSettings {
                url_template: env::var("GEOCODE_URL").unwrap_or(defaults.geocode.url_template),
                timeout: parse_millis("GEOCODE_TIMEOUT_MS", defaults.geocode.timeout),
                max_attempts: parse_u32("GEOCODE_MAX_ATTEMPTS", defaults.geocode.max_attempts)
                    .max(1),
                backoff_base: parse_millis("GEOCODE_BACKOFF_MS", defaults.geocode.backoff_base),
            },
            postproc: PostprocSettings {
                filter_by_city: parse_bool("POSTPROC_FILTER", true),
                flatten: parse_bool("POSTPROC_FLATTEN", false),
                convert_ascii: parse_bool("POSTPROC_ASCII", false),
                replace_newline: parse_bool("POSTPROC_REPLACE_NEWLINE", false),
            },
            fileio: FileIoSettings {
                autosave_every: parse_usize("AUTOSAVE_EVERY", defaults.fileio.autosave_every),
                keep_autosave: parse_bool("KEEP_AUTOSAVE", false),
                output_indent: parse_usize("OUTPUT_INDENT", defaults.fileio.output_indent),
                event_log_path: env::var("EVENT_LOG_PATH")
                    .ok()
                    .filter(|v| !v.trim().is_empty()),
            },
            webclient: WebClientSettings {
                webdriver_url: env::var("WEBDRIVER_URL")
                    .unwrap_or(defaults.webclient.webdriver_url),
                browser: env::var("BROWSER")
                    .ok()
                    .and_then(|v| Browser::parse(&v).ok())
                    .unwrap_or(defaults.webclient.browser),
                show: parse_bool("BROWSER_SHOW", false),
            },
        }
    }
}

/// Checks the output path before any session is opened and substitutes the
/// timestamp placeholder when requested.
pub fn validate_output_path(path: &str, use_timestamp: bool) -> AppResult<String> {
    if path.trim().is_empty() {
        return Err(AppError::Config("output filename must not be empty".into()));
    }
    if !use_timestamp {
        return Ok(path.to_string());
    }
    if !path.contains(TIMESTAMP_PLACEHOLDER) {
        return Err(AppError::Config(format!(
            "specify the timestamp location in the output filename using {TIMESTAMP_PLACEHOLDER}"
        )));
    }
    let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
    Ok(path.replace(TIMESTAMP_PLACEHOLDER, &stamp))
}

pub fn autosave_path_for(output: &str) -> String {
    format!("{output}.autosave")
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
