//! Core domain model for the survey enrichment pipeline.

use std::cmp::Ordering;
use chrono::NaiveDateTime;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "emcs-core";

pub const EMAIL_PROPERTY: &str = "email";
pub const START_TIME_PROPERTY: &str = "start_time";

/// Scalar survey cell after ingestion. `Null` is the explicit empty marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Text(String),
    Number(f64),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Collapse blank strings and NaN into `Null`, trimming text.
    pub fn normalized(self) -> Self {
        match self {
            CellValue::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    CellValue::Null
                } else if trimmed.len() == text.len() {
                    CellValue::Text(text)
                } else {
                    CellValue::Text(trimmed.to_string())
                }
            }
            CellValue::Number(n) if n.is_nan() => CellValue::Null,
            other => other,
        }
    }

    /// String form used for join keys and text report columns.
    pub fn render(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Text(text) => Some(text.clone()),
            CellValue::Number(n) => Some(n.to_string()),
            CellValue::Timestamp(ts) => Some(ts.format("%Y-%m-%dT%H:%M:%S").to_string()),
        }
    }

    /// Total order for `start_time` sorting: timestamps, then numbers, then
    /// text, with nulls last.
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        fn rank(value: &CellValue) -> u8 {
            match value {
                CellValue::Timestamp(_) => 0,
                CellValue::Number(_) => 1,
                CellValue::Text(_) => 2,
                CellValue::Null => 3,
            }
        }

        match (self, other) {
            (CellValue::Timestamp(a), CellValue::Timestamp(b)) => a.cmp(b),
            (CellValue::Number(a), CellValue::Number(b)) => a.total_cmp(b),
            (CellValue::Text(a), CellValue::Text(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

/// One deduplicated survey row, labelled by property name. `values` keeps
/// the schema's declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyResponse {
    /// Position of the row in the source sheet (header excluded).
    pub row_index: usize,
    pub values: Vec<(String, CellValue)>,
}

impl SurveyResponse {
    pub fn get(&self, property: &str) -> &CellValue {
        self.values
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, value)| value)
            .unwrap_or(&CellValue::Null)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    pub fn email(&self) -> Option<String> {
        self.get(EMAIL_PROPERTY).render()
    }

    pub fn start_time(&self) -> &CellValue {
        self.get(START_TIME_PROPERTY)
    }
}

/// Directory entry for one resolved person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identifier_email: String,
    #[serde(default)]
    pub displayname: Option<String>,
    #[serde(default)]
    pub jobtitle: Option<String>,
    #[serde(default)]
    pub organization_name: Option<String>,
    #[serde(default)]
    pub organization_uri: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Published scientific asset attributed to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub identifier_email: String,
    pub additionaltype: String,
    /// Publication year; null or missing dates are kept as `None`.
    #[serde(default, deserialize_with = "deserialize_year")]
    pub datepublished: Option<i32>,
}

/// Subject/property/object assertion about an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub subject_identifier_email: String,
    pub property_label: String,
    pub object_label: String,
}

/// The three fact collections as returned by the resolver and stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityBatch {
    #[serde(default)]
    pub directory: Vec<IdentityRecord>,
    #[serde(default)]
    pub assets: Vec<AssetRecord>,
    #[serde(default)]
    pub claims: Vec<ClaimRecord>,
}

impl IdentityBatch {
    pub fn is_empty(&self) -> bool {
        self.directory.is_empty() && self.assets.is_empty() && self.claims.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Directory,
    Assets,
    Claims,
}

impl FactCategory {
    pub const ALL: [FactCategory; 3] = [
        FactCategory::Directory,
        FactCategory::Assets,
        FactCategory::Claims,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FactCategory::Directory => "directory",
            FactCategory::Assets => "assets",
            FactCategory::Claims => "claims",
        }
    }
}

/// `(additionaltype, count)` pair; serializes as a two-element array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetTypeCount(pub String, pub usize);

/// Present only when an identity has at least one asset. The year span is
/// absent when none of the assets carries a year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetFacts {
    pub scientific_assets_summary: Vec<AssetTypeCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_year_published: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_year_published: Option<i32>,
}

/// Present only when an identity has at least one claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimFacts {
    pub job_titles: Vec<String>,
    pub organization_affiliations: Vec<String>,
    pub distinct_coauthors: usize,
    pub expertise_terms: Vec<String>,
    pub metadata_keywords: Vec<String>,
}

/// Fixed-shape per-identity summary. Absent fact groups leave their keys out
/// of the serialized form entirely rather than emitting nulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    #[serde(flatten)]
    pub identity: IdentityRecord,
    #[serde(flatten)]
    pub assets: Option<AssetFacts>,
    #[serde(flatten)]
    pub claims: Option<ClaimFacts>,
}

impl ProfileSummary {
    pub fn identifier(&self) -> &str {
        &self.identity.identifier_email
    }
}

fn deserialize_year<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawYear {
        Int(i64),
        Float(f64),
        Text(String),
    }

    let Some(raw) = Option::<RawYear>::deserialize(deserializer)? else {
        return Ok(None);
    };
    match raw {
        RawYear::Int(n) => i32::try_from(n)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("year out of range: {n}"))),
        RawYear::Float(f) if f.is_nan() => Ok(None),
        RawYear::Float(f) if f.fract() == 0.0 && f.abs() < i32::MAX as f64 => Ok(Some(f as i32)),
        RawYear::Float(f) => Err(D::Error::custom(format!("not a year: {f}"))),
        RawYear::Text(text) if text.trim().is_empty() => Ok(None),
        RawYear::Text(text) => text
            .trim()
            .get(..4)
            .and_then(|year| year.parse().ok())
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("unparseable datepublished: {text:?}"))),
    }
}
