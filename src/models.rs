use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// The five satisfaction-score fields carried by rating-bearing units.
pub const RATING_FIELDS: [&str; 5] = [
    "ratingQuantity",
    "ratingServicesPersonnel",
    "ratingTraining",
    "ratingAttitude",
    "ratingPromptness",
];

pub const RECOMMENDATION_FIELD: &str = "recommendation";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: Uuid,
    pub created_at: Option<DateTime<Utc>>,
    pub fields: Fields,
}

impl Record {
    pub fn new(fields: Fields) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Some(Utc::now()),
            fields,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|value| !value.is_null())
    }

    /// Looks up `parent.child` inside an object-valued field.
    pub fn get_nested(&self, parent: &str, child: &str) -> Option<&Value> {
        self.get(parent)?
            .as_object()?
            .get(child)
            .filter(|value| !value.is_null())
    }

    pub fn rating(&self, field: &str) -> Option<u8> {
        self.get(field).and_then(parse_rating)
    }
}

pub fn touch(fields: &mut Fields) {
    fields.insert(
        UPDATED_AT_FIELD.to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
}

/// Accepts integral numbers and numeric strings in `1..=5`.
pub fn parse_rating(value: &Value) -> Option<u8> {
    let score = match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0)
                .map(|float| float as i64)
        })?,
        Value::String(text) => text.trim().parse::<i64>().ok()?,
        _ => return None,
    };

    (1..=5).contains(&score).then_some(score as u8)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitCount {
    pub label: String,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FieldTally {
    pub sum: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitRatings {
    pub by_field: BTreeMap<String, FieldTally>,
    pub by_score: BTreeMap<u8, u64>,
    pub rated_count: u64,
    pub total_records: u64,
    pub averages: BTreeMap<String, Option<String>>,
    pub overall_avg: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStats {
    pub by_unit: BTreeMap<String, UnitCount>,
    pub by_month: BTreeMap<String, u64>,
    pub by_province: BTreeMap<String, u64>,
    pub total: u64,
    pub unit_ratings: BTreeMap<String, UnitRatings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub id: Option<Uuid>,
    pub op: ChangeOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}
