//! Survey ingestion: schema mapping, spreadsheet reading and respondent dedup.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDateTime;
use emcs_core::{CellValue, SurveyResponse, EMAIL_PROPERTY, START_TIME_PROPERTY};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "emcs-adapters";

/// Data model compiled into the binary; `--schema` replaces it at runtime.
pub const BUNDLED_SCHEMA: &str = include_str!("../schema/survey_data_model.yaml");

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("reading schema {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing schema: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("schema version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("property `{0}` is mapped more than once")]
    DuplicateProperty(String),
    #[error("property `{0}` has no source column index")]
    MissingColumnIndex(String),
    #[error("schema does not map the required property `{0}`")]
    MissingRequired(&'static str),
}

#[derive(Debug, Error)]
pub enum SurveyReadError {
    #[error("opening survey workbook {}: {message}", path.display())]
    Open { path: PathBuf, message: String },
    #[error("survey workbook {} has no worksheets", .0.display())]
    NoWorksheet(PathBuf),
    #[error("reading worksheet `{sheet}` of {}: {message}", path.display())]
    Sheet {
        path: PathBuf,
        sheet: String,
        message: String,
    },
}

/// One row of the data model sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    #[serde(rename = "col_index", default)]
    pub source_column_index: Option<u32>,
    #[serde(rename = "property", default)]
    pub property_name: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SchemaFile {
    version: u32,
    #[serde(default)]
    columns: Vec<SchemaEntry>,
}

/// Positional extraction rules: `column_indices[i]` feeds `property_names[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub column_indices: Vec<u32>,
    pub property_names: Vec<String>,
}

impl ColumnMapping {
    pub fn from_entries(entries: &[SchemaEntry]) -> Result<Self, SchemaError> {
        let mut column_indices = Vec::new();
        let mut property_names = Vec::new();
        let mut seen = HashSet::new();

        for entry in entries {
            let Some(property) = &entry.property_name else {
                continue;
            };
            if !seen.insert(property.as_str()) {
                return Err(SchemaError::DuplicateProperty(property.clone()));
            }
            let index = entry
                .source_column_index
                .ok_or_else(|| SchemaError::MissingColumnIndex(property.clone()))?;
            column_indices.push(index);
            property_names.push(property.clone());
        }

        for required in [EMAIL_PROPERTY, START_TIME_PROPERTY] {
            if !seen.contains(required) {
                return Err(SchemaError::MissingRequired(required));
            }
        }

        Ok(Self {
            column_indices,
            property_names,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = serde_yaml::from_str(text)?;
        if file.version != SCHEMA_VERSION {
            return Err(SchemaError::UnsupportedVersion(file.version));
        }
        Self::from_entries(&file.columns)
    }

    pub fn bundled() -> Result<Self, SchemaError> {
        Self::from_yaml(BUNDLED_SCHEMA)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.column_indices
            .iter()
            .copied()
            .zip(self.property_names.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.property_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.property_names.is_empty()
    }
}

/// First worksheet of a survey export. `rows` excludes the header row and is
/// indexed by absolute column position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub header: Vec<Option<String>>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RawTable {
    pub fn width(&self) -> usize {
        self.rows
            .iter()
            .map(Vec::len)
            .chain(std::iter::once(self.header.len()))
            .max()
            .unwrap_or(0)
    }
}

fn cell_value(cell: &Data) -> CellValue {
    let value = match cell {
        Data::Empty | Data::Error(_) => CellValue::Null,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Int(n) => CellValue::Number(*n as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::Bool(b) => CellValue::Text(b.to_string()),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(ts) => CellValue::Timestamp(ts),
            None => CellValue::Number(dt.as_f64()),
        },
        Data::DateTimeIso(s) => parse_iso_timestamp(s)
            .map(CellValue::Timestamp)
            .unwrap_or_else(|| CellValue::Text(s.clone())),
        Data::DurationIso(s) => CellValue::Text(s.clone()),
    };
    value.normalized()
}

fn parse_iso_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Read the first worksheet of a spreadsheet (`.xlsx`, `.xls`, `.ods`). The
/// first row is the header; fully blank rows are skipped.
pub fn read_survey(path: impl AsRef<Path>) -> Result<RawTable, SurveyReadError> {
    let path = path.as_ref();
    let mut workbook = open_workbook_auto(path).map_err(|e| SurveyReadError::Open {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| SurveyReadError::NoWorksheet(path.to_path_buf()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| SurveyReadError::Sheet {
            path: path.to_path_buf(),
            sheet: sheet.clone(),
            message: e.to_string(),
        })?;

    let (Some((header_row, _)), Some((last_row, last_col))) = (range.start(), range.end()) else {
        warn!(path = %path.display(), sheet = %sheet, "survey worksheet is empty");
        return Ok(RawTable::default());
    };
    let cell_at = |row: u32, col: u32| {
        range
            .get_value((row, col))
            .map(cell_value)
            .unwrap_or(CellValue::Null)
    };

    let header = (0..=last_col).map(|col| cell_at(header_row, col).render()).collect();
    let rows: Vec<Vec<CellValue>> = ((header_row + 1)..=last_row)
        .map(|row| (0..=last_col).map(|col| cell_at(row, col)).collect::<Vec<_>>())
        .filter(|row| row.iter().any(|cell| !cell.is_null()))
        .collect();

    info!(path = %path.display(), sheet = %sheet, rows = rows.len(), "read survey export");
    Ok(RawTable { header, rows })
}

/// Deduplicated responses plus the distinct identifiers they carry.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSurvey {
    pub responses: Vec<SurveyResponse>,
    pub source_identifiers: BTreeSet<String>,
    pub duplicates_dropped: usize,
}

/// Project raw rows through the mapping, keep each respondent's earliest
/// submission, and return survivors in their original order.
pub fn normalize_responses(table: &RawTable, mapping: &ColumnMapping) -> NormalizedSurvey {
    let width = table.width();
    for (col, property) in mapping.iter() {
        if col as usize >= width {
            warn!(col, property, width, "mapped column is outside the survey sheet");
        }
    }

    let projected: Vec<SurveyResponse> = table
        .rows
        .iter()
        .enumerate()
        .map(|(row_index, row)| {
            let values: Vec<(String, CellValue)> = mapping
                .iter()
                .map(|(col, property)| {
                    let value = row
                        .get(col as usize)
                        .cloned()
                        .unwrap_or(CellValue::Null)
                        .normalized();
                    (property.to_string(), value)
                })
                .collect();
            SurveyResponse { row_index, values }
        })
        .collect();

    // Stable sort by start time; the first occurrence of each email wins.
    let mut by_start: Vec<usize> = (0..projected.len()).collect();
    by_start.sort_by(|&a, &b| projected[a].start_time().sort_cmp(projected[b].start_time()));

    let mut seen_emails = HashSet::new();
    let mut keep = vec![false; projected.len()];
    for idx in by_start {
        if seen_emails.insert(projected[idx].email()) {
            keep[idx] = true;
        }
    }

    let total = projected.len();
    let responses: Vec<SurveyResponse> = projected
        .into_iter()
        .zip(keep)
        .filter_map(|(response, kept)| kept.then_some(response))
        .collect();
    let source_identifiers: BTreeSet<String> =
        responses.iter().filter_map(SurveyResponse::email).collect();
    let duplicates_dropped = total - responses.len();

    if duplicates_dropped > 0 {
        debug!(duplicates_dropped, "dropped repeat submissions");
    }
    info!(
        rows = total,
        responses = responses.len(),
        identifiers = source_identifiers.len(),
        "normalized survey responses"
    );

    NormalizedSurvey {
        responses,
        source_identifiers,
        duplicates_dropped,
    }
}
