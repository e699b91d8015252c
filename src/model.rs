use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const QUERY_TERM: &str = "query_term";
pub const QUERY_LOCATION: &str = "query_location";
pub const QUERY_KEYWORD: &str = "query_keyword";
pub const QUERY_LANG: &str = "query_lang";
pub const QUERY_TIMESTAMP: &str = "query_timestamp";
pub const QUERY_STATUS: &str = "query_status";
pub const QUERY_RESULTS_COUNT: &str = "query_results_count";
pub const QUERY_RESULTS: &str = "query_results";
/// Pass-through field a caller may use to name the city a query targets.
pub const TARGET_CITY: &str = "nama_kabupaten_kota";

const RESERVED_KEYS: [&str; 8] = [
    QUERY_TERM,
    QUERY_LOCATION,
    QUERY_KEYWORD,
    QUERY_LANG,
    QUERY_TIMESTAMP,
    QUERY_STATUS,
    QUERY_RESULTS_COUNT,
    QUERY_RESULTS,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    #[default]
    Incomplete,
    Missing,
    Errored,
    Complete,
    CompleteWithMissingMunicipalities,
}

impl QueryStatus {
    pub const ALL: [QueryStatus; 5] = [
        QueryStatus::Incomplete,
        QueryStatus::Missing,
        QueryStatus::Errored,
        QueryStatus::Complete,
        QueryStatus::CompleteWithMissingMunicipalities,
    ];

    pub fn as_tag(&self) -> &'static str {
        match self {
            QueryStatus::Incomplete => "INCOMPLETE",
            QueryStatus::Missing => "MISSING",
            QueryStatus::Errored => "ERRORED",
            QueryStatus::Complete => "COMPLETE",
            QueryStatus::CompleteWithMissingMunicipalities => {
                "COMPLETE_WITH_MISSING_MUNICIPALITIES"
            }
        }
    }

    /// Terminal records are skipped on resume.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryStatus::Missing
                | QueryStatus::Complete
                | QueryStatus::CompleteWithMissingMunicipalities
        )
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            QueryStatus::Complete | QueryStatus::CompleteWithMissingMunicipalities
        )
    }

    /// Whether a record in this state may move to `next` within one run.
    /// Any record may become `MISSING` once its keyword is found empty.
    pub fn can_advance_to(&self, next: QueryStatus) -> bool {
        if next == QueryStatus::Missing {
            return true;
        }
        match self {
            QueryStatus::Incomplete => true,
            QueryStatus::Errored => next != QueryStatus::Incomplete,
            QueryStatus::Missing => false,
            QueryStatus::Complete => next == QueryStatus::Complete,
            QueryStatus::CompleteWithMissingMunicipalities => next.is_complete(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceRecord {
    #[serde(rename = "location_name")]
    pub name: String,
    #[serde(rename = "location_type")]
    pub place_type: String,
    pub latitude: String,
    pub longitude: String,
    #[serde(rename = "id_provinsi")]
    pub province_id: String,
    #[serde(rename = "nama_provinsi")]
    pub province_name: String,
    #[serde(rename = "id_kabupaten_kota")]
    pub city_id: String,
    #[serde(rename = "nama_kabupaten_kota")]
    pub city_name: String,
    #[serde(rename = "id_kecamatan")]
    pub district_id: String,
    #[serde(rename = "nama_kecamatan")]
    pub district_name: String,
    #[serde(rename = "id_kelurahan_desa")]
    pub village_id: String,
    #[serde(rename = "nama_kelurahan_desa")]
    pub village_name: String,
    #[serde(rename = "kode_pos")]
    pub postal_code: String,
    pub rating: String,
    pub reviews: String,
    pub description: String,
    #[serde(rename = "location_link")]
    pub location_link: String,
}

impl PlaceRecord {
    pub fn has_coordinates(&self) -> bool {
        !self.latitude.trim().is_empty() && !self.longitude.trim().is_empty()
    }

    pub fn is_resolved(&self) -> bool {
        !self.province_id.is_empty() || !self.province_name.is_empty()
    }

    pub(crate) fn map_strings(&mut self, f: &dyn Fn(&str) -> String) {
        for field in [
            &mut self.name,
            &mut self.place_type,
            &mut self.latitude,
            &mut self.longitude,
            &mut self.province_id,
            &mut self.province_name,
            &mut self.city_id,
            &mut self.city_name,
            &mut self.district_id,
            &mut self.district_name,
            &mut self.village_id,
            &mut self.village_name,
            &mut self.postal_code,
            &mut self.rating,
            &mut self.reviews,
            &mut self.description,
            &mut self.location_link,
        ] {
            *field = f(field);
        }
    }
}

/// One unit of batch work. Unknown fields from the source survive untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    #[serde(rename = "query_term", default)]
    pub term: Option<String>,
    #[serde(rename = "query_location", default)]
    pub location: Option<String>,
    #[serde(rename = "query_keyword", default)]
    pub keyword: Option<String>,
    #[serde(rename = "query_lang", default)]
    pub language: Option<String>,
    #[serde(rename = "query_timestamp", default)]
    pub timestamp: i64,
    #[serde(rename = "query_status", default)]
    pub status: QueryStatus,
    #[serde(rename = "query_results_count", default)]
    pub result_count: usize,
    #[serde(rename = "query_results", default)]
    pub places: Vec<PlaceRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueryRecord {
    /// A fresh record for `"<term> <location>"`. Blank locations produce a
    /// record without a keyword.
    pub fn generate(term: &str, location: Option<&str>, extra: Map<String, Value>) -> Self {
        let location = location
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        let keyword = location.as_ref().map(|l| format!("{term} {l}"));
        let mut extra = extra;
        for key in RESERVED_KEYS {
            extra.remove(key);
        }
        Self {
            term: Some(term.to_string()),
            location,
            keyword,
            extra,
            ..Self::default()
        }
    }

    pub fn keyword(&self) -> Option<&str> {
        self.keyword
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    /// City every place result is expected to belong to.
    pub fn target_city(&self) -> Option<&str> {
        self.extra
            .get(TARGET_CITY)
            .and_then(Value::as_str)
            .or(self.location.as_deref())
            .filter(|c| !c.trim().is_empty())
    }

    pub fn with_places(mut self, places: Vec<PlaceRecord>) -> Self {
        self.result_count = places.len();
        self.places = places;
        self
    }

    pub fn with_status(mut self, status: QueryStatus) -> Self {
        self.status = status;
        self
    }

    pub(crate) fn map_strings(&mut self, f: &dyn Fn(&str) -> String) {
        for field in [
            &mut self.term,
            &mut self.location,
            &mut self.keyword,
            &mut self.language,
        ] {
            if let Some(value) = field.as_mut() {
                *value = f(value);
            }
        }
        for place in &mut self.places {
            place.map_strings(f);
        }
        for value in self.extra.values_mut() {
            map_value_strings(value, f);
        }
    }
}

/// A query head joined with one of its place records. Only term, keyword,
/// language and timestamp are carried over from the head.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRow {
    #[serde(rename = "query_term", default)]
    pub term: Option<String>,
    #[serde(rename = "query_keyword", default)]
    pub keyword: Option<String>,
    #[serde(rename = "query_lang", default)]
    pub language: Option<String>,
    #[serde(rename = "query_timestamp", default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub place: PlaceRecord,
}

impl FlatRow {
    pub fn new(head: &QueryRecord, place: &PlaceRecord) -> Self {
        Self {
            term: head.term.clone(),
            keyword: head.keyword.clone(),
            language: head.language.clone(),
            timestamp: head.timestamp,
            place: place.clone(),
        }
    }

    pub(crate) fn map_strings(&mut self, f: &dyn Fn(&str) -> String) {
        for field in [
            &mut self.term,
            &mut self.keyword,
            &mut self.language,
        ] {
            if let Some(value) = field.as_mut() {
                *value = f(value);
            }
        }
        self.place.map_strings(f);
    }
}

/// Builds a fresh batch, one record per source item, in source order.
///
/// Items may be plain strings (the location) or objects carrying
/// `query_location`; other object fields are kept as pass-through extras.
pub fn generate_batch(term: &str, items: Vec<Value>) -> Vec<QueryRecord> {
    items
        .into_iter()
        .map(|item| match item {
            Value::String(location) => QueryRecord::generate(term, Some(&location), Map::new()),
            Value::Object(fields) => {
                let location = fields
                    .get(QUERY_LOCATION)
                    .and_then(Value::as_str)
                    .map(str::to_string);
                QueryRecord::generate(term, location.as_deref(), fields)
            }
            _ => QueryRecord::generate(term, None, Map::new()),
        })
        .collect()
}

/// One location per non-blank line.
pub fn locations_from_lines(text: &str) -> Vec<Value> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Value::String(line.to_string()))
        .collect()
}

fn map_value_strings(value: &mut Value, f: &dyn Fn(&str) -> String) {
    match value {
        Value::String(text) => *text = f(text),
        Value::Array(items) => items.iter_mut().for_each(|v| map_value_strings(v, f)),
        Value::Object(map) => map.values_mut().for_each(|v| map_value_strings(v, f)),
        _ => {}
    }
}
