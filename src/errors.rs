use std::io;
use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Config(String),
    #[error("browser session failed: {0}")]
    Session(#[from] SessionError),
    #[error("status cannot move from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Failures reported by a browser-session provider.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not start webdriver session: {0}")]
    Start(#[from] fantoccini::error::NewSessionError),
    #[error("webdriver command failed: {0}")]
    Command(#[from] fantoccini::error::CmdError),
    #[error("could not encode script arguments: {0}")]
    Script(#[from] serde_json::Error),
    #[error("element {0} is stale; look it up again")]
    StaleElement(String),
    #[error("session is closed")]
    Closed,
}

/// Per-query fatal errors. Any of these marks the owning record `ERRORED`.
#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("query text must not be empty")]
    EmptyQuery,
    #[error("anti-automation challenge detected")]
    Challenge,
    #[error("page did not finish loading within {0:?}")]
    LoadTimeout(Duration),
    #[error("no results list; query may have resolved to a single place")]
    NotAResultsList,
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Per-record soft failures from the reverse lookup.
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("latitude/longitude field is empty")]
    MissingCoordinates,
    #[error("municipality lookup failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("municipality lookup returned an unusable body: {0}")]
    Decode(String),
}
