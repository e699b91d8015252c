use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::config::GeocodeSettings;
use crate::errors::{AppResult, GeocodeError};
use crate::model::PlaceRecord;
use crate::telemetry::Telemetry;

static DIGIT_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]+").expect("digit run pattern is valid"));

/// Body returned by the reverse lookup service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MunicipalityResponse {
    pub code: String,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub village: String,
    #[serde(default)]
    pub postal: Value,
}

impl MunicipalityResponse {
    pub fn postal_code(&self) -> String {
        match &self.postal {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminCodes {
    pub province: String,
    pub city: String,
    pub district: String,
    pub village: String,
}

/// Splits a hierarchical code into per-level identifiers.
///
/// Separators are ignored; each level concatenates one more digit run than
/// its parent. A level with too few runs gets an empty identifier.
pub fn decompose_code(code: &str) -> AdminCodes {
    let runs: Vec<&str> = DIGIT_RUN.find_iter(code).map(|m| m.as_str()).collect();
    let level = |depth: usize| {
        if runs.len() >= depth {
            runs[..depth].concat()
        } else {
            String::new()
        }
    };
    AdminCodes {
        province: level(1),
        city: level(2),
        district: level(3),
        village: if runs.len() >= 4 {
            runs.concat()
        } else {
            String::new()
        },
    }
}

#[async_trait]
pub trait MunicipalityLookup: Send + Sync {
    async fn lookup(
        &self,
        latitude: &str,
        longitude: &str,
    ) -> Result<MunicipalityResponse, GeocodeError>;
}

/// HTTP client for a lookup service addressed by a URL template containing
/// `{latitude}` and `{longitude}`.
pub struct HttpMunicipalityClient {
    http: reqwest::Client,
    url_template: String,
}

impl HttpMunicipalityClient {
    pub fn new(settings: &GeocodeSettings) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            http,
            url_template: settings.url_template.clone(),
        })
    }

    fn url_for(&self, latitude: &str, longitude: &str) -> String {
        self.url_template
            .replace("{latitude}", &latitude.trim().replace(',', "."))
            .replace("{longitude}", &longitude.trim().replace(',', "."))
    }
}

#[async_trait]
impl MunicipalityLookup for HttpMunicipalityClient {
    async fn lookup(
        &self,
        latitude: &str,
        longitude: &str,
    ) -> Result<MunicipalityResponse, GeocodeError> {
        let body = self
            .http
            .get(self.url_for(latitude, longitude))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        serde_json::from_slice(&body).map_err(|err| GeocodeError::Decode(err.to_string()))
    }
}

/// Outcome of resolving a list of places. `failures` counts places that are
/// still without administrative fields.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub places: Vec<PlaceRecord>,
    pub failures: usize,
}

pub struct GeocodeResolver {
    lookup: Arc<dyn MunicipalityLookup>,
    max_attempts: u32,
    backoff_base: Duration,
    jitter_rng: Arc<Mutex<StdRng>>,
    telemetry: Telemetry,
}

impl GeocodeResolver {
    pub fn new(settings: &GeocodeSettings, telemetry: Telemetry) -> AppResult<Self> {
        let client = HttpMunicipalityClient::new(settings)?;
        Ok(Self::with_lookup(Arc::new(client), settings, telemetry))
    }

    pub fn with_lookup(
        lookup: Arc<dyn MunicipalityLookup>,
        settings: &GeocodeSettings,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            lookup,
            max_attempts: settings.max_attempts.max(1),
            backoff_base: settings.backoff_base,
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            telemetry,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.jitter_rng = Arc::new(Mutex::new(rng));
        self
    }

    /// Returns a copy of `place` with its administrative fields filled in.
    pub async fn resolve(&self, place: &PlaceRecord) -> Result<PlaceRecord, GeocodeError> {
        if !place.has_coordinates() {
            return Err(GeocodeError::MissingCoordinates);
        }
        let response = self
            .lookup_with_retry(&place.latitude, &place.longitude)
            .await?;
        let codes = decompose_code(&response.code);
        Ok(PlaceRecord {
            province_id: codes.province,
            province_name: response.province.clone(),
            city_id: codes.city,
            city_name: response.city.clone(),
            district_id: codes.district,
            district_name: response.district.clone(),
            village_id: codes.village,
            village_name: response.village.clone(),
            postal_code: response.postal_code(),
            ..place.clone()
        })
    }

    pub async fn resolve_all(&self, places: Vec<PlaceRecord>) -> Resolution {
        self.resolve_where(places, |_| true).await
    }

    /// Re-resolves only places that are still unresolved and have
    /// coordinates. Everything else is kept as is.
    pub async fn resolve_unresolved(&self, places: Vec<PlaceRecord>) -> Resolution {
        self.resolve_where(places, |place| !place.is_resolved()).await
    }

    async fn resolve_where<F>(&self, places: Vec<PlaceRecord>, wanted: F) -> Resolution
    where
        F: Fn(&PlaceRecord) -> bool,
    {
        let mut resolution = Resolution {
            places: Vec::with_capacity(places.len()),
            failures: 0,
        };
        for place in places {
            if !wanted(&place) {
                resolution.places.push(place);
                continue;
            }
            match self.resolve(&place).await {
                Ok(resolved) => resolution.places.push(resolved),
                Err(err) => {
                    self.telemetry.warn(
                        "geocode_failed",
                        json!({ "name": place.name, "error": err.to_string() }),
                    );
                    resolution.failures += 1;
                    resolution.places.push(place);
                }
            }
        }
        if resolution.failures > 0 {
            self.telemetry.warn(
                "geocode_incomplete",
                json!({ "failures": resolution.failures, "total": resolution.places.len() }),
            );
        }
        resolution
    }

    async fn lookup_with_retry(
        &self,
        latitude: &str,
        longitude: &str,
    ) -> Result<MunicipalityResponse, GeocodeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.lookup.lookup(latitude, longitude).await {
                Ok(response) => return Ok(response),
                Err(GeocodeError::Transport(err)) if attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    self.telemetry.debug(
                        "geocode_retry",
                        json!({
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "error": err.to_string(),
                        }),
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.backoff_base.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(base_ms * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..base_ms))
        };
        base + jitter
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};

    use super::*;
    use crate::telemetry::MemorySink;

    fn settings(url_template: String, max_attempts: u32) -> GeocodeSettings {
        GeocodeSettings {
            url_template,
            timeout: Duration::from_secs(2),
            max_attempts,
            backoff_base: Duration::ZERO,
        }
    }

    fn place(latitude: &str, longitude: &str) -> PlaceRecord {
        PlaceRecord {
            name: "Kopi Ku".into(),
            latitude: latitude.into(),
            longitude: longitude.into(),
            ..PlaceRecord::default()
        }
    }

    struct ScriptedLookup {
        responses: Mutex<VecDeque<Result<MunicipalityResponse, GeocodeError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedLookup {
        fn new(responses: Vec<Result<MunicipalityResponse, GeocodeError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl MunicipalityLookup for ScriptedLookup {
        async fn lookup(&self, _: &str, _: &str) -> Result<MunicipalityResponse, GeocodeError> {
            *self.calls.lock() += 1;
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(GeocodeError::Decode("exhausted".into())))
        }
    }

    fn bandung() -> MunicipalityResponse {
        MunicipalityResponse {
            code: "32.73.01.1002".into(),
            province: "Jawa Barat".into(),
            city: "Kota Bandung".into(),
            district: "Sukasari".into(),
            village: "Gegerkalong".into(),
            postal: json!(40153),
        }
    }

    #[test]
    fn decomposes_dotted_code() {
        let codes = decompose_code("33.74.01.1002");
        assert_eq!(codes.province, "33");
        assert_eq!(codes.city, "3374");
        assert_eq!(codes.district, "337401");
        assert_eq!(codes.village, "3374011002");
    }

    #[test]
    fn short_codes_leave_lower_levels_empty() {
        let codes = decompose_code("33-74");
        assert_eq!(codes.city, "3374");
        assert!(codes.district.is_empty());
        assert!(codes.village.is_empty());
        assert_eq!(decompose_code(""), AdminCodes::default());
    }

    #[tokio::test]
    async fn missing_coordinates_is_a_soft_failure() {
        let lookup = Arc::new(ScriptedLookup::new(vec![]));
        let resolver = GeocodeResolver::with_lookup(
            lookup.clone(),
            &settings(String::new(), 3),
            Telemetry::default(),
        );

        let err = resolver.resolve(&place("", "107.6")).await.unwrap_err();
        assert!(matches!(err, GeocodeError::MissingCoordinates));
        assert_eq!(*lookup.calls.lock(), 0);
    }

    #[tokio::test]
    async fn counts_failures_and_keeps_order() {
        let memory = Arc::new(MemorySink::default());
        let lookup = Arc::new(ScriptedLookup::new(vec![Ok(bandung())]));
        let resolver = GeocodeResolver::with_lookup(
            lookup,
            &settings(String::new(), 1),
            Telemetry::default().with_sink(memory.clone()),
        );

        let resolution = resolver
            .resolve_all(vec![place("-6.9", "107.6"), place("", ""), place("-6.8", "107.5")])
            .await;

        assert_eq!(resolution.places.len(), 3);
        assert_eq!(resolution.failures, 2);
        assert_eq!(resolution.places[0].city_name, "Kota Bandung");
        assert_eq!(resolution.places[0].postal_code, "40153");
        assert!(!resolution.places[2].is_resolved());
        assert_eq!(memory.count("geocode_failed"), 2);
    }

    #[tokio::test]
    async fn resolve_unresolved_skips_resolved_places() {
        let lookup = Arc::new(ScriptedLookup::new(vec![Ok(bandung())]));
        let resolver = GeocodeResolver::with_lookup(
            lookup.clone(),
            &settings(String::new(), 1),
            Telemetry::default(),
        );
        let mut done = place("-6.9", "107.6");
        done.province_id = "32".into();

        let resolution = resolver
            .resolve_unresolved(vec![done.clone(), place("-6.8", "107.5")])
            .await;

        assert_eq!(resolution.failures, 0);
        assert_eq!(resolution.places[0], done);
        assert_eq!(resolution.places[1].village_id, "3273011002");
        assert_eq!(*lookup.calls.lock(), 1);
    }

    #[tokio::test]
    async fn http_client_retries_server_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of!(
                request::method_path("GET", "/reverse"),
                request::query(url_decoded(contains(("lat", "-6.9"))))
            ))
            .times(2)
            .respond_with(httptest::cycle![
                status_code(503),
                json_encoded(json!({
                    "code": "32.73.01.1002",
                    "province": "Jawa Barat",
                    "city": "Kota Bandung",
                    "district": "Sukasari",
                    "village": "Gegerkalong",
                    "postal": "40153"
                })),
            ]),
        );
        let template = format!(
            "{}?lat={{latitude}}&lon={{longitude}}",
            server.url("/reverse")
        );
        let settings = settings(template, 3);
        let resolver = GeocodeResolver::new(&settings, Telemetry::default())
            .unwrap()
            .with_rng(StdRng::seed_from_u64(7));

        let resolved = resolver.resolve(&place("-6,9", "107.6")).await.unwrap();
        assert_eq!(resolved.province_id, "32");
        assert_eq!(resolved.postal_code, "40153");
    }

    #[tokio::test]
    async fn undecodable_body_is_not_retried() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/reverse"))
                .times(1)
                .respond_with(json_encoded(json!({ "unexpected": true }))),
        );
        let template = format!("{}?lat={{latitude}}&lon={{longitude}}", server.url("/reverse"));
        let resolver = GeocodeResolver::new(&settings(template, 5), Telemetry::default()).unwrap();

        let err = resolver.resolve(&place("-6.9", "107.6")).await.unwrap_err();
        assert!(matches!(err, GeocodeError::Decode(_)));
    }

    #[tokio::test]
    async fn non_json_body_is_a_decode_failure() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/reverse"))
                .times(1)
                .respond_with(status_code(200).body("<html>maintenance</html>")),
        );
        let template = format!("{}?lat={{latitude}}&lon={{longitude}}", server.url("/reverse"));
        let resolver = GeocodeResolver::new(&settings(template, 5), Telemetry::default()).unwrap();

        let err = resolver.resolve(&place("-6.9", "107.6")).await.unwrap_err();
        assert!(matches!(err, GeocodeError::Decode(_)));
    }
}
