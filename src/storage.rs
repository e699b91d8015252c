use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Serializer, Value};

use crate::errors::{AppError, AppResult};
use crate::model::{self, FlatRow, QueryRecord};
use crate::postprocess::replace_newlines;

const CSV_HEADER: [&str; 21] = [
    model::QUERY_TERM,
    model::QUERY_KEYWORD,
    model::QUERY_LANG,
    model::QUERY_TIMESTAMP,
    "location_name",
    "location_type",
    "latitude",
    "longitude",
    "id_provinsi",
    "nama_provinsi",
    "id_kabupaten_kota",
    "nama_kabupaten_kota",
    "id_kecamatan",
    "nama_kecamatan",
    "id_kelurahan_desa",
    "nama_kelurahan_desa",
    "kode_pos",
    "rating",
    "reviews",
    "description",
    "location_link",
];

pub fn read_batch<P: AsRef<Path>>(path: P) -> AppResult<Vec<QueryRecord>> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Reads location items from either a JSON array or a plain text file with
/// one location per line.
pub fn read_source_items<P: AsRef<Path>>(path: P) -> AppResult<Vec<Value>> {
    let text = fs::read_to_string(path.as_ref())?;
    if !text.trim_start().starts_with('[') {
        return Ok(model::locations_from_lines(&text));
    }
    match serde_json::from_str(&text)? {
        Value::Array(items) => Ok(items),
        _ => Err(AppError::Config(format!(
            "{} is not a JSON array",
            path.as_ref().display()
        ))),
    }
}

/// Writes a complete snapshot. `indent == 0` produces compact JSON.
pub fn write_json<P, T>(path: P, value: &T, indent: usize) -> AppResult<()>
where
    P: AsRef<Path>,
    T: Serialize + ?Sized,
{
    let mut writer = BufWriter::new(create(path.as_ref())?);
    if indent == 0 {
        serde_json::to_writer(&mut writer, value)?;
    } else {
        let indent = vec![b' '; indent];
        let mut serializer =
            Serializer::with_formatter(&mut writer, PrettyFormatter::with_indent(&indent));
        value.serialize(&mut serializer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Flat rows as CSV. Newlines inside fields are replaced.
pub fn write_csv<P: AsRef<Path>>(path: P, rows: &[FlatRow]) -> AppResult<()> {
    let mut writer = csv::Writer::from_writer(create(path.as_ref())?);
    writer.write_record(CSV_HEADER)?;
    for row in rows {
        writer.write_record(csv_record(row).iter().map(|field| replace_newlines(field)))?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_record(row: &FlatRow) -> [String; 21] {
    let place = &row.place;
    [
        row.term.clone().unwrap_or_default(),
        row.keyword.clone().unwrap_or_default(),
        row.language.clone().unwrap_or_default(),
        row.timestamp.to_string(),
        place.name.clone(),
        place.place_type.clone(),
        place.latitude.clone(),
        place.longitude.clone(),
        place.province_id.clone(),
        place.province_name.clone(),
        place.city_id.clone(),
        place.city_name.clone(),
        place.district_id.clone(),
        place.district_name.clone(),
        place.village_id.clone(),
        place.village_name.clone(),
        place.postal_code.clone(),
        place.rating.clone(),
        place.reviews.clone(),
        place.description.clone(),
        place.location_link.clone(),
    ]
}

/// Returns whether a file was actually removed.
pub fn remove_if_exists<P: AsRef<Path>>(path: P) -> AppResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn create(path: &Path) -> AppResult<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(File::create(path)?)
}
