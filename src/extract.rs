use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::models::Record;

/// Date-like fields probed for the month key, highest priority first.
pub const DATE_FIELDS: [&str; 12] = [
    "dateOfMonitoring",
    "dateOfInspection",
    "dateOfSurveillance",
    "dateOfSampling",
    "dateOfCollection",
    "dateOfVaccination",
    "dateOfApplication",
    "dateOfRegistration",
    "dateIssued",
    "dateReceived",
    "reportDate",
    "date",
];

pub const PROVINCES: [&str; 5] = [
    "Occidental Mindoro",
    "Oriental Mindoro",
    "Marinduque",
    "Romblon",
    "Palawan",
];

const MUNICIPALITIES: [(&str, &str); 24] = [
    ("sablayan", "Occidental Mindoro"),
    ("san jose", "Occidental Mindoro"),
    ("mamburao", "Occidental Mindoro"),
    ("abra de ilog", "Occidental Mindoro"),
    ("calintaan", "Occidental Mindoro"),
    ("magsaysay", "Occidental Mindoro"),
    ("calapan", "Oriental Mindoro"),
    ("calapan city", "Oriental Mindoro"),
    ("puerto galera", "Oriental Mindoro"),
    ("naujan", "Oriental Mindoro"),
    ("pinamalayan", "Oriental Mindoro"),
    ("roxas", "Oriental Mindoro"),
    ("boac", "Marinduque"),
    ("gasan", "Marinduque"),
    ("mogpog", "Marinduque"),
    ("santa cruz", "Marinduque"),
    ("odiongan", "Romblon"),
    ("san agustin", "Romblon"),
    ("cajidiocan", "Romblon"),
    ("puerto princesa", "Palawan"),
    ("puerto princesa city", "Palawan"),
    ("coron", "Palawan"),
    ("el nido", "Palawan"),
    ("brooke's point", "Palawan"),
];

/// Field whose content is a binary upload; displayed only as a marker.
pub const ATTACHMENT_FIELD: &str = "attachment";

type DateExtractor = fn(&Record) -> Option<NaiveDate>;
type ProvinceExtractor = fn(&Record) -> Option<&'static str>;

fn date_field<const I: usize>(record: &Record) -> Option<NaiveDate> {
    record.get(DATE_FIELDS[I]).and_then(parse_date)
}

fn created_at(record: &Record) -> Option<NaiveDate> {
    record.created_at.map(|at| at.date_naive())
}

const MONTH_EXTRACTORS: [DateExtractor; 13] = [
    date_field::<0>,
    date_field::<1>,
    date_field::<2>,
    date_field::<3>,
    date_field::<4>,
    date_field::<5>,
    date_field::<6>,
    date_field::<7>,
    date_field::<8>,
    date_field::<9>,
    date_field::<10>,
    date_field::<11>,
    created_at,
];

fn nested_place(record: &Record, parent: &str, child: &str) -> Option<&'static str> {
    record
        .get_nested(parent, child)
        .and_then(Value::as_str)
        .and_then(normalize_place)
}

fn address_province(record: &Record) -> Option<&'static str> {
    nested_place(record, "address", "province")
}

fn address_municipality(record: &Record) -> Option<&'static str> {
    nested_place(record, "address", "municipality")
}

fn location_province(record: &Record) -> Option<&'static str> {
    nested_place(record, "location", "province")
}

fn location_municipality(record: &Record) -> Option<&'static str> {
    nested_place(record, "location", "municipality")
}

fn flat_province(record: &Record) -> Option<&'static str> {
    record
        .get("province")
        .and_then(Value::as_str)
        .and_then(normalize_place)
}

fn flat_municipality(record: &Record) -> Option<&'static str> {
    record
        .get("municipality")
        .and_then(Value::as_str)
        .and_then(normalize_place)
}

fn free_text_address(record: &Record) -> Option<&'static str> {
    let text = record.get("address")?.as_str()?.to_lowercase();
    PROVINCES
        .iter()
        .copied()
        .find(|province| text.contains(&province.to_lowercase()))
        .or_else(|| {
            text.split(',')
                .map(str::trim)
                .find_map(municipality_province)
        })
}

const PROVINCE_EXTRACTORS: [ProvinceExtractor; 7] = [
    address_province,
    address_municipality,
    location_province,
    location_municipality,
    flat_province,
    flat_municipality,
    free_text_address,
];

pub fn month_key_of(record: &Record) -> Option<String> {
    MONTH_EXTRACTORS
        .iter()
        .find_map(|extract| extract(record))
        .map(|date| date.format("%Y-%m").to_string())
}

pub fn province_of(record: &Record) -> Option<&'static str> {
    PROVINCE_EXTRACTORS
        .iter()
        .find_map(|extract| extract(record))
}

/// Exact case-insensitive province match, else municipality lookup.
pub fn normalize_place(raw: &str) -> Option<&'static str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    PROVINCES
        .iter()
        .copied()
        .find(|province| province.eq_ignore_ascii_case(trimmed))
        .or_else(|| municipality_province(trimmed))
}

fn municipality_province(name: &str) -> Option<&'static str> {
    let lowered = name.trim().to_lowercase();
    MUNICIPALITIES
        .iter()
        .find(|(municipality, _)| *municipality == lowered)
        .map(|(_, province)| *province)
}

pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(text) => parse_date_text(text.trim()),
        Value::Number(number) => DateTime::from_timestamp_millis(number.as_i64()?)
            .map(|at| at.date_naive()),
        Value::Object(map) => {
            let seconds = map
                .get("seconds")
                .or_else(|| map.get("_seconds"))?
                .as_i64()?;
            DateTime::from_timestamp(seconds, 0).map(|at| at.date_naive())
        }
        _ => None,
    }
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    if text.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(text, format) {
            return Some(at.date());
        }
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    None
}

pub fn project_for_display(record: &Record) -> BTreeMap<String, String> {
    let mut row = BTreeMap::new();
    row.insert("id".to_string(), record.id.to_string());
    row.insert(
        "createdAt".to_string(),
        record
            .created_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default(),
    );

    for (key, value) in &record.fields {
        let cell = if key == ATTACHMENT_FIELD {
            attachment_marker(value).to_string()
        } else {
            display_value(value)
        };
        row.insert(key.clone(), cell);
    }

    row
}

fn attachment_marker(value: &Value) -> &'static str {
    match value {
        Value::Null => "No",
        Value::String(text) if text.is_empty() => "No",
        Value::Bool(false) => "No",
        _ => "Yes",
    }
}

pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) => items
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => {
            if let Some(stamp) = timestamp_object(map) {
                return stamp;
            }
            map.iter()
                .filter(|(_, inner)| !inner.is_null())
                .map(|(key, inner)| format!("{key}: {}", display_value(inner)))
                .collect::<Vec<_>>()
                .join("; ")
        }
    }
}

fn timestamp_object(map: &serde_json::Map<String, Value>) -> Option<String> {
    let only_stamp_keys = map
        .keys()
        .all(|key| matches!(key.as_str(), "seconds" | "nanoseconds" | "_seconds" | "_nanoseconds"));
    if !only_stamp_keys {
        return None;
    }
    let seconds = map
        .get("seconds")
        .or_else(|| map.get("_seconds"))?
        .as_i64()?;
    DateTime::from_timestamp(seconds, 0).map(|at| at.format("%Y-%m-%d %H:%M").to_string())
}

/// `dateOfMonitoring` / `date_of_monitoring` -> `Date Of Monitoring`.
/// Every capital starts a word, so `pHLevel` reads `P H Level`.
pub fn title_case(key: &str) -> String {
    let mut spaced = String::with_capacity(key.len() + 8);

    for ch in key.chars() {
        if ch == '_' || ch == '-' {
            spaced.push(' ');
        } else {
            if ch.is_uppercase() {
                spaced.push(' ');
            }
            spaced.push(ch);
        }
    }

    spaced
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Master-records browser filter; unset criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub month: Option<String>,
    pub province: Option<String>,
    pub search: Option<String>,
}

impl RecordFilter {
    pub fn is_empty(&self) -> bool {
        self.month.is_none() && self.province.is_none() && self.search.is_none()
    }

    pub fn matches(&self, record: &Record) -> bool {
        if let Some(month) = &self.month {
            if month_key_of(record).as_deref() != Some(month.as_str()) {
                return false;
            }
        }

        if let Some(province) = &self.province {
            let matched = province_of(record)
                .is_some_and(|found| found.eq_ignore_ascii_case(province.trim()));
            if !matched {
                return false;
            }
        }

        if let Some(search) = &self.search {
            let needle = search.trim().to_lowercase();
            if !needle.is_empty() {
                let row = project_for_display(record);
                if !row.values().any(|cell| cell.to_lowercase().contains(&needle)) {
                    return false;
                }
            }
        }

        true
    }

    pub fn apply<'a>(&self, records: &'a [Record]) -> Vec<&'a Record> {
        records.iter().filter(|record| self.matches(record)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record(fields: Value) -> Record {
        Record {
            id: uuid::Uuid::nil(),
            created_at: None,
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn month_key_is_none_without_any_date() {
        let doc = record(json!({ "establishmentName": "Feedmill A", "remarks": "ok" }));
        assert_eq!(month_key_of(&doc), None);
    }

    #[test]
    fn month_key_follows_field_priority() {
        let doc = record(json!({
            "date": "2024-01-05",
            "dateOfInspection": "2024-03-09",
            "dateOfMonitoring": "not a date",
        }));
        assert_eq!(month_key_of(&doc).as_deref(), Some("2024-03"));
    }

    #[test]
    fn month_key_accepts_common_date_shapes() {
        let cases = [
            (json!({ "date": "2024-02-29T08:30:00Z" }), "2024-02"),
            (json!({ "date": "2024-07-01T10:15" }), "2024-07"),
            (json!({ "date": "11/30/2023" }), "2023-11"),
            (json!({ "date": "March 4, 2025" }), "2025-03"),
            (json!({ "date": 1_704_067_200_000_i64 }), "2024-01"),
            (json!({ "date": { "seconds": 1_717_200_000, "nanoseconds": 0 } }), "2024-06"),
        ];
        for (fields, expected) in cases {
            assert_eq!(month_key_of(&record(fields)).as_deref(), Some(expected));
        }
    }

    #[test]
    fn month_key_falls_back_to_creation_time() {
        let mut doc = record(json!({ "remarks": "none" }));
        doc.created_at = Some(Utc.with_ymd_and_hms(2025, 9, 14, 3, 0, 0).unwrap());
        assert_eq!(month_key_of(&doc).as_deref(), Some("2025-09"));
    }

    #[test]
    fn province_matches_any_case() {
        for spelling in ["Palawan", "PALAWAN", "palawan", "  pAlAwAn "] {
            let doc = record(json!({ "address": { "province": spelling } }));
            assert_eq!(province_of(&doc), Some("Palawan"));
        }
    }

    #[test]
    fn province_from_municipality_lookup() {
        let doc = record(json!({ "municipality": "Sablayan" }));
        assert_eq!(province_of(&doc), Some("Occidental Mindoro"));
    }

    #[test]
    fn unresolvable_province_skips_to_next_probe() {
        let doc = record(json!({
            "address": { "province": "Region IV-B", "municipality": "Boac" },
        }));
        assert_eq!(province_of(&doc), Some("Marinduque"));
    }

    #[test]
    fn province_from_free_text_address() {
        let doc = record(json!({ "address": "Brgy. Poblacion, Odiongan, Romblon" }));
        assert_eq!(province_of(&doc), Some("Romblon"));

        let doc = record(json!({ "address": "Sitio Centro, Coron" }));
        assert_eq!(province_of(&doc), Some("Palawan"));
    }

    #[test]
    fn province_is_none_for_unknown_places() {
        let doc = record(json!({ "province": "Batangas", "address": { "street": "Main" } }));
        assert_eq!(province_of(&doc), None);
        assert_eq!(province_of(&record(json!({ "province": 42 }))), None);
    }

    #[test]
    fn projection_flattens_values() {
        let doc = record(json!({
            "address": { "municipality": "Gasan", "province": "Marinduque" },
            "species": ["cattle", "goat"],
            "attachment": "data:image/png;base64,AAAA",
            "remarks": null,
            "headCount": 12,
            "inspectedOn": { "seconds": 1_717_200_000, "nanoseconds": 0 },
        }));
        let row = project_for_display(&doc);
        assert_eq!(row["address"], "municipality: Gasan; province: Marinduque");
        assert_eq!(row["species"], "cattle, goat");
        assert_eq!(row["attachment"], "Yes");
        assert_eq!(row["remarks"], "");
        assert_eq!(row["headCount"], "12");
        assert_eq!(row["inspectedOn"], "2024-06-01 00:00");
        assert_eq!(row["id"], uuid::Uuid::nil().to_string());
        assert_eq!(row["createdAt"], "");
    }

    #[test]
    fn missing_attachment_is_marked_no() {
        let row = project_for_display(&record(json!({ "attachment": null })));
        assert_eq!(row["attachment"], "No");
    }

    #[test]
    fn title_case_splits_camel_and_snake() {
        assert_eq!(title_case("dateOfMonitoring"), "Date Of Monitoring");
        assert_eq!(title_case("owner_name"), "Owner Name");
        assert_eq!(title_case("id"), "Id");
        assert_eq!(title_case("ratingQuantity"), "Rating Quantity");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn title_case_splits_every_capital() {
        assert_eq!(title_case("pHLevel"), "P H Level");
        assert_eq!(title_case("ownerID"), "Owner I D");
        assert_eq!(title_case("HeadCount"), "Head Count");
        assert_eq!(title_case("sample_ID"), "Sample I D");
    }

    #[test]
    fn filter_combines_criteria() {
        let docs = vec![
            record(json!({ "date": "2024-05-02", "municipality": "Boac", "farmName": "Sunrise Farm" })),
            record(json!({ "date": "2024-05-20", "province": "Palawan", "farmName": "Hilltop" })),
            record(json!({ "date": "2024-06-01", "province": "Palawan", "farmName": "Sunrise Annex" })),
        ];

        let filter = RecordFilter {
            month: Some("2024-05".into()),
            ..RecordFilter::default()
        };
        assert_eq!(filter.apply(&docs).len(), 2);

        let filter = RecordFilter {
            province: Some("palawan".into()),
            search: Some("sunrise".into()),
            ..RecordFilter::default()
        };
        let matched = filter.apply(&docs);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].fields["date"], json!("2024-06-01"));

        assert!(RecordFilter::default().is_empty());
        assert_eq!(RecordFilter::default().apply(&docs).len(), 3);
    }
}
