//! Turns the captured results container into place records.
//!
//! Every field is read independently. A missing sub-element leaves that
//! field empty and never rejects the entry.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::form_urlencoded;

use crate::model::PlaceRecord;

pub const RESULT: &str = ".Nv2PK";
pub const RESULTS_BOX: &str = ".DxyBCb";
pub const RESULTS_SENTINEL: &str = ".lXJj5c";
pub const LANDMARK: &str = "#searchbox";
pub const CHALLENGE: &str = "iframe[src][title=\"reCAPTCHA\"]";

static RESULT_SELECTOR: Lazy<Selector> = Lazy::new(|| selector(RESULT));
static NAME: Lazy<Selector> = Lazy::new(|| selector(".qBF1Pd"));
static TYPE: Lazy<Selector> = Lazy::new(|| selector(".W4Efsd.W4Efsd>span>span"));
static LINK: Lazy<Selector> = Lazy::new(|| selector("a[href]"));
static RATING: Lazy<Selector> = Lazy::new(|| selector(".MW4etd"));
static REVIEWS: Lazy<Selector> = Lazy::new(|| selector(".UY7F9"));
static DESCRIPTION: Lazy<Selector> = Lazy::new(|| selector(".W4Efsd.W4Efsd"));
static IMAGE: Lazy<Selector> = Lazy::new(|| selector("img[src]"));

static LATITUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!3d(-?\d+[.,]\d+)").expect("latitude pattern is valid"));
static LONGITUDE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!4d(-?\d+[.,]\d+)").expect("longitude pattern is valid"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|_| panic!("static selector {css:?} is valid"))
}

/// Extracts every result entry in document order. `lang` is the language of
/// the query, which is appended to each location link.
pub fn extract_places(html: &str, lang: &str) -> Vec<PlaceRecord> {
    let fragment = Html::parse_fragment(html);
    fragment
        .select(&RESULT_SELECTOR)
        .map(|entry| extract_place(entry, lang))
        .collect()
}

fn extract_place(entry: ElementRef<'_>, lang: &str) -> PlaceRecord {
    let href = entry
        .select(&LINK)
        .next()
        .and_then(|a| a.value().attr("href"));
    PlaceRecord {
        name: first_text(entry, &NAME),
        place_type: first_text(entry, &TYPE),
        latitude: href.map(|h| capture(&LATITUDE, h)).unwrap_or_default(),
        longitude: href.map(|h| capture(&LONGITUDE, h)).unwrap_or_default(),
        rating: first_text(entry, &RATING).replace(',', "."),
        reviews: first_text(entry, &REVIEWS)
            .chars()
            .filter(char::is_ascii_digit)
            .collect(),
        description: description(entry),
        location_link: href.map(|h| location_link(h, lang)).unwrap_or_default(),
        ..PlaceRecord::default()
    }
}

fn first_text(entry: ElementRef<'_>, selector: &Selector) -> String {
    entry
        .select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

fn capture(pattern: &Regex, href: &str) -> String {
    pattern
        .captures(href)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

// The first block repeats the place type.
fn description(entry: ElementRef<'_>) -> String {
    entry
        .select(&DESCRIPTION)
        .skip(1)
        .map(|block| {
            block
                .text()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn location_link(href: &str, lang: &str) -> String {
    let base = href.split('?').next().unwrap_or_default();
    let lang: String = form_urlencoded::byte_serialize(lang.as_bytes()).collect();
    format!("{base}?hl={lang}")
}

/// Source URL of the first image in an entry at its original resolution.
pub fn image_link(entry_html: &str) -> String {
    let fragment = Html::parse_fragment(entry_html);
    fragment
        .select(&IMAGE)
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(original_size)
        .unwrap_or_default()
}

fn original_size(src: &str) -> String {
    src.rsplit_once('=')
        .map(|(head, _)| head)
        .unwrap_or(src)
        .to_string()
}
