pub mod app;
pub mod batch;
pub mod config;
pub mod errors;
pub mod extract;
pub mod geocode;
pub mod model;
pub mod navigator;
pub mod postprocess;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod webdriver;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use app::{generate, run_batch, run_with_session, telemetry_for, RunOptions};
pub use batch::{BatchDriver, BatchReport, StepReport};
pub use config::{AppConfig, Depth};
pub use errors::{AppError, AppResult, GeocodeError, NavigationError, SessionError};
pub use geocode::{GeocodeResolver, MunicipalityLookup, MunicipalityResponse};
pub use model::{generate_batch, FlatRow, PlaceRecord, QueryRecord, QueryStatus};
pub use navigator::{Navigator, PaginationSummary, StopReason};
pub use postprocess::{Pipeline, ProcessedBatch};
pub use session::{BrowserSession, ElementHandle};
pub use telemetry::{MemorySink, Telemetry};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,mapsweep_lib=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
