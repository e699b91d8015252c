//! Cleanup stages applied to a finished batch before export.
//!
//! Stages always run in the order filter, flatten, ascii, newline. Each one
//! works on owned data and is idempotent, so the live batch is never touched.

use serde::Serialize;
use deunicode::deunicode_with_tofu;
use serde_json::json;

use crate::config::PostprocSettings;
use crate::model::{FlatRow, QueryRecord};
use crate::telemetry::Telemetry;

pub const ASCII_PLACEHOLDER: &str = "?";
pub const NEWLINE_REPLACEMENT: &str = "; ";

/// Output of the pipeline. Flattening changes the shape of the data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProcessedBatch {
    Nested(Vec<QueryRecord>),
    Flat(Vec<FlatRow>),
}

impl ProcessedBatch {
    pub fn len(&self) -> usize {
        match self {
            ProcessedBatch::Nested(records) => records.len(),
            ProcessedBatch::Flat(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn map_strings(mut self, f: &dyn Fn(&str) -> String) -> Self {
        match &mut self {
            ProcessedBatch::Nested(records) => records.iter_mut().for_each(|r| r.map_strings(f)),
            ProcessedBatch::Flat(rows) => rows.iter_mut().for_each(|r| r.map_strings(f)),
        }
        self
    }
}

pub struct Pipeline {
    settings: PostprocSettings,
    telemetry: Telemetry,
}

impl Pipeline {
    pub fn new(settings: PostprocSettings, telemetry: Telemetry) -> Self {
        Self {
            settings,
            telemetry,
        }
    }

    pub fn run(&self, records: &[QueryRecord]) -> ProcessedBatch {
        let mut records = records.to_vec();
        if self.settings.filter_by_city {
            let removed = filter_by_city(&mut records);
            self.telemetry
                .info("filtered_by_city", json!({ "removed": removed }));
        }

        let mut batch = if self.settings.flatten {
            let rows = flatten(&records);
            self.telemetry
                .info("flattened", json!({ "rows": rows.len() }));
            ProcessedBatch::Flat(rows)
        } else {
            ProcessedBatch::Nested(records)
        };

        if self.settings.convert_ascii {
            batch = batch.map_strings(&to_ascii);
            self.telemetry.debug("converted_ascii", json!({}));
        }
        if self.settings.replace_newline {
            batch = batch.map_strings(&replace_newlines);
            self.telemetry.debug("replaced_newlines", json!({}));
        }
        batch
    }
}

/// Drops places whose city does not match the owning query's target city
/// and returns how many were removed. Records without a target are left
/// alone.
pub fn filter_by_city(records: &mut [QueryRecord]) -> usize {
    let mut removed = 0;
    for record in records.iter_mut() {
        let Some(target) = record.target_city().map(normalize_city) else {
            continue;
        };
        let before = record.places.len();
        record
            .places
            .retain(|place| normalize_city(&place.city_name) == target);
        removed += before - record.places.len();
        record.result_count = record.places.len();
    }
    removed
}

fn normalize_city(name: &str) -> String {
    name.trim().to_lowercase()
}

/// One row per place; queries without places produce nothing.
pub fn flatten(records: &[QueryRecord]) -> Vec<FlatRow> {
    records
        .iter()
        .flat_map(|record| record.places.iter().map(move |place| FlatRow::new(record, place)))
        .collect()
}

/// Transliterates `text` to its nearest ASCII form. Characters with no known
/// transliteration become [`ASCII_PLACEHOLDER`].
pub fn to_ascii(text: &str) -> String {
    deunicode_with_tofu(text, ASCII_PLACEHOLDER)
}

pub fn replace_newlines(text: &str) -> String {
    text.replace('\n', NEWLINE_REPLACEMENT)
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::model::PlaceRecord;

    fn place(name: &str, city: &str) -> PlaceRecord {
        PlaceRecord {
            name: name.into(),
            city_name: city.into(),
            description: "Kedai Kopi\nBuka".into(),
            ..PlaceRecord::default()
        }
    }

    fn bandung() -> QueryRecord {
        QueryRecord::generate("cafe", Some("Kota Bandung"), Map::new()).with_places(vec![
            place("Kopi Ku", " kota bandung "),
            place("Kopi Sana", "Kota Cimahi"),
            place("Kafé Braga", "KOTA BANDUNG"),
        ])
    }

    #[test]
    fn filter_keeps_matching_cities_only() {
        let mut records = vec![bandung()];
        let removed = filter_by_city(&mut records);

        assert_eq!(removed, 1);
        assert_eq!(records[0].result_count, 2);
        assert_eq!(records[0].places[0].name, "Kopi Ku");
        assert_eq!(records[0].places[1].name, "Kafé Braga");
    }

    #[test]
    fn filter_skips_records_without_target() {
        let mut records = vec![QueryRecord::generate("cafe", None, Map::new())
            .with_places(vec![place("Kopi Ku", "Kota Bandung")])];
        assert_eq!(filter_by_city(&mut records), 0);
        assert_eq!(records[0].places.len(), 1);
    }

    #[test]
    fn flatten_yields_one_row_per_place() {
        let mut empty = QueryRecord::generate("cafe", Some("Kota Cimahi"), Map::new());
        empty.timestamp = 1_700_000_000;
        let rows = flatten(&[bandung(), empty]);

        assert_eq!(rows.len(), 3);
        assert!(rows
            .iter()
            .all(|row| row.keyword.as_deref() == Some("cafe Kota Bandung")));
        assert_eq!(rows[2].place.name, "Kafé Braga");
    }

    #[test]
    fn ascii_transliterates_to_nearest_form() {
        assert_eq!(to_ascii("Kafé Braga"), "Kafe Braga");
        assert_eq!(to_ascii("Straße"), "Strasse");
        assert_eq!(to_ascii("Đà Lạt"), "Da Lat");
        assert_eq!(to_ascii(&to_ascii("Kafé")), "Kafe");

        for text in ["Kedai Kopi · Jl. Braga", "Kopi Ku’s", "Buka – Tutup", "Ørsted"] {
            let ascii = to_ascii(text);
            assert!(ascii.is_ascii(), "{ascii:?}");
            assert!(!ascii.contains(ASCII_PLACEHOLDER), "{text:?} -> {ascii:?}");
        }
        assert!(to_ascii("Kedai Kopi · Jl. Braga").starts_with("Kedai Kopi "));
        assert!(to_ascii("Kedai Kopi · Jl. Braga").ends_with(" Jl. Braga"));
    }

    #[test]
    fn ascii_marks_untransliterable_characters() {
        assert_eq!(to_ascii("a\u{F0000}b"), "a?b");
    }

    #[test]
    fn pipeline_runs_stages_in_order_on_a_copy() {
        let records = vec![bandung()];
        let pipeline = Pipeline::new(
            PostprocSettings {
                filter_by_city: true,
                flatten: true,
                convert_ascii: true,
                replace_newline: true,
            },
            Telemetry::default(),
        );

        let ProcessedBatch::Flat(rows) = pipeline.run(&records) else {
            panic!("expected flat rows");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].place.name, "Kafe Braga");
        assert_eq!(rows[0].place.description, "Kedai Kopi; Buka");
        assert_eq!(records[0].places.len(), 3);

        let again = pipeline.run(&records);
        assert_eq!(again, ProcessedBatch::Flat(rows));
    }

    #[test]
    fn nested_output_keeps_shape_and_extras() {
        let mut extra = Map::new();
        extra.insert("catatan".into(), json!(["baris\nbaru"]));
        let records = vec![QueryRecord::generate("cafe", Some("Kota Bandung"), extra)];
        let pipeline = Pipeline::new(
            PostprocSettings {
                replace_newline: true,
                ..PostprocSettings::default()
            },
            Telemetry::default(),
        );

        let ProcessedBatch::Nested(out) = pipeline.run(&records) else {
            panic!("expected nested records");
        };
        assert_eq!(out[0].extra["catatan"], json!(["baris; baru"]));
    }
}
