//! Rendering of the enriched survey table as an xlsx workbook or Parquet file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::builder::{ListBuilder, StringBuilder};
use arrow_array::{
    ArrayRef, Float64Array, Int32Array, RecordBatch, StringArray, TimestampMillisecondArray,
    UInt64Array,
};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::NaiveDateTime;
use emcs_core::{AssetFacts, CellValue, ClaimFacts, ProfileSummary};
use emcs_storage::write_atomic;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::EnrichedRow;

/// Profile columns appended after the survey columns, in output order.
pub const PROFILE_COLUMNS: [&str; 14] = [
    "identifier_email",
    "displayname",
    "jobtitle",
    "organization_name",
    "organization_uri",
    "url",
    "scientific_assets_summary",
    "first_year_published",
    "last_year_published",
    "job_titles",
    "organization_affiliations",
    "distinct_coauthors",
    "expertise_terms",
    "metadata_keywords",
];

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("building report columns: {0}")]
    Arrow(#[from] ArrowError),
    #[error("encoding parquet report: {0}")]
    Parquet(#[from] ParquetError),
    #[error("encoding xlsx report: {0}")]
    Xlsx(#[from] XlsxError),
    #[error("encoding asset summary: {0}")]
    Json(#[from] serde_json::Error),
    #[error("writing report {}: {message}", path.display())]
    Write { path: PathBuf, message: String },
}

/// Worksheet the xlsx report is written to.
pub const SHEET_NAME: &str = "Sheet1";

const TIMESTAMP_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";

/// Excel serial day number of 1970-01-01.
const UNIX_EPOCH_SERIAL: f64 = 25569.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Xlsx,
    Parquet,
}

impl ReportFormat {
    /// `.parquet` selects Parquet; anything else is written as xlsx.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("parquet") => ReportFormat::Parquet,
            _ => ReportFormat::Xlsx,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Xlsx => "xlsx",
            ReportFormat::Parquet => "parquet",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub path: String,
    pub format: ReportFormat,
    pub rows: usize,
    pub columns: usize,
    pub matched_rows: usize,
    pub sha256: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Timestamp,
    Number,
    Text,
}

fn column_kind<'a>(values: impl Iterator<Item = &'a CellValue>) -> ColumnKind {
    let mut kind = None;
    for value in values {
        let this = match value {
            CellValue::Null => continue,
            CellValue::Timestamp(_) => ColumnKind::Timestamp,
            CellValue::Number(_) => ColumnKind::Number,
            CellValue::Text(_) => return ColumnKind::Text,
        };
        match kind {
            None => kind = Some(this),
            Some(existing) if existing != this => return ColumnKind::Text,
            Some(_) => {}
        }
    }
    kind.unwrap_or(ColumnKind::Text)
}

fn survey_column(rows: &[EnrichedRow<'_>], property: &str) -> (DataType, ArrayRef) {
    let values = || rows.iter().map(|row| row.response.get(property));
    match column_kind(values()) {
        ColumnKind::Timestamp => {
            let millis = values()
                .map(|value| match value {
                    CellValue::Timestamp(ts) => Some(ts.and_utc().timestamp_millis()),
                    _ => None,
                })
                .collect::<Vec<_>>();
            (
                DataType::Timestamp(TimeUnit::Millisecond, None),
                Arc::new(TimestampMillisecondArray::from(millis)) as ArrayRef,
            )
        }
        ColumnKind::Number => {
            let numbers = values()
                .map(|value| match value {
                    CellValue::Number(n) => Some(*n),
                    _ => None,
                })
                .collect::<Vec<_>>();
            (DataType::Float64, Arc::new(Float64Array::from(numbers)) as ArrayRef)
        }
        ColumnKind::Text => {
            let texts = values().map(CellValue::render).collect::<Vec<_>>();
            (DataType::Utf8, Arc::new(StringArray::from(texts)) as ArrayRef)
        }
    }
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn text_column<F>(rows: &[EnrichedRow<'_>], pick: F) -> (DataType, ArrayRef)
where
    F: Fn(&ProfileSummary) -> Option<&str>,
{
    let texts = rows
        .iter()
        .map(|row| row.profile.and_then(&pick))
        .collect::<Vec<_>>();
    (DataType::Utf8, Arc::new(StringArray::from(texts)) as ArrayRef)
}

fn list_column<F>(rows: &[EnrichedRow<'_>], pick: F) -> (DataType, ArrayRef)
where
    F: Fn(&ClaimFacts) -> &Vec<String>,
{
    let mut builder = ListBuilder::new(StringBuilder::new());
    for row in rows {
        match row.profile.and_then(|p| p.claims.as_ref()) {
            Some(claims) => {
                for item in pick(claims) {
                    builder.values().append_value(item);
                }
                builder.append(true);
            }
            None => builder.append(false),
        }
    }
    (
        DataType::List(Arc::new(ArrowField::new("item", DataType::Utf8, true))),
        Arc::new(builder.finish()) as ArrayRef,
    )
}

fn year_column<F>(rows: &[EnrichedRow<'_>], pick: F) -> (DataType, ArrayRef)
where
    F: Fn(&AssetFacts) -> Option<i32>,
{
    let years = rows
        .iter()
        .map(|row| row.profile.and_then(|p| p.assets.as_ref()).and_then(&pick))
        .collect::<Vec<_>>();
    (DataType::Int32, Arc::new(Int32Array::from(years)) as ArrayRef)
}

fn profile_column(rows: &[EnrichedRow<'_>], name: &str) -> Result<(DataType, ArrayRef), ReportError> {
    let column = match name {
        "identifier_email" => text_column(rows, |p| Some(p.identity.identifier_email.as_str())),
        "displayname" => text_column(rows, |p| non_blank(p.identity.displayname.as_ref())),
        "jobtitle" => text_column(rows, |p| non_blank(p.identity.jobtitle.as_ref())),
        "organization_name" => {
            text_column(rows, |p| non_blank(p.identity.organization_name.as_ref()))
        }
        "organization_uri" => text_column(rows, |p| non_blank(p.identity.organization_uri.as_ref())),
        "url" => text_column(rows, |p| non_blank(p.identity.url.as_ref())),
        "scientific_assets_summary" => {
            let mut encoded = Vec::with_capacity(rows.len());
            for row in rows {
                let facts = row.profile.and_then(|p| p.assets.as_ref());
                encoded.push(match facts {
                    Some(facts) => Some(serde_json::to_string(&facts.scientific_assets_summary)?),
                    None => None,
                });
            }
            (DataType::Utf8, Arc::new(StringArray::from(encoded)) as ArrayRef)
        }
        "first_year_published" => year_column(rows, |a| a.first_year_published),
        "last_year_published" => year_column(rows, |a| a.last_year_published),
        "job_titles" => list_column(rows, |c| &c.job_titles),
        "organization_affiliations" => list_column(rows, |c| &c.organization_affiliations),
        "expertise_terms" => list_column(rows, |c| &c.expertise_terms),
        "metadata_keywords" => list_column(rows, |c| &c.metadata_keywords),
        "distinct_coauthors" => {
            let counts = rows
                .iter()
                .map(|row| {
                    row.profile
                        .and_then(|p| p.claims.as_ref())
                        .map(|c| c.distinct_coauthors as u64)
                })
                .collect::<Vec<_>>();
            (DataType::UInt64, Arc::new(UInt64Array::from(counts)) as ArrayRef)
        }
        other => {
            return Err(ReportError::Arrow(ArrowError::InvalidArgumentError(format!(
                "unknown profile column {other}"
            ))))
        }
    };
    Ok(column)
}

/// Survey columns named like a profile column get `_x`, the profile column `_y`.
fn output_names(survey_properties: &[String]) -> (Vec<String>, Vec<String>) {
    let profile: HashSet<&str> = PROFILE_COLUMNS.into_iter().collect();
    let survey: HashSet<&str> = survey_properties.iter().map(String::as_str).collect();

    let survey_names = survey_properties
        .iter()
        .map(|p| {
            if profile.contains(p.as_str()) {
                format!("{p}_x")
            } else {
                p.clone()
            }
        })
        .collect();
    let profile_names = PROFILE_COLUMNS
        .iter()
        .map(|p| {
            if survey.contains(p) {
                format!("{p}_y")
            } else {
                (*p).to_string()
            }
        })
        .collect();
    (survey_names, profile_names)
}

/// Build the enriched table as a single Arrow record batch.
pub fn build_record_batch(
    survey_properties: &[String],
    rows: &[EnrichedRow<'_>],
) -> Result<RecordBatch, ReportError> {
    let (survey_names, profile_names) = output_names(survey_properties);
    let mut fields = Vec::with_capacity(survey_names.len() + profile_names.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.capacity());

    for (property, name) in survey_properties.iter().zip(&survey_names) {
        let (data_type, array) = survey_column(rows, property);
        fields.push(ArrowField::new(name, data_type, true));
        columns.push(array);
    }
    for (column, name) in PROFILE_COLUMNS.iter().zip(&profile_names) {
        let (data_type, array) = profile_column(rows, column)?;
        fields.push(ArrowField::new(name, data_type, true));
        columns.push(array);
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, ReportError> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)?;
    writer.write(batch)?;
    Ok(writer.into_inner()?)
}

fn excel_serial(ts: &NaiveDateTime) -> f64 {
    UNIX_EPOCH_SERIAL + ts.and_utc().timestamp_millis() as f64 / 86_400_000.0
}

#[derive(Debug, Clone, PartialEq)]
enum SheetCell {
    Empty,
    Text(String),
    Number(f64),
}

fn json_text<T: Serialize + ?Sized>(value: &T) -> Result<SheetCell, ReportError> {
    Ok(SheetCell::Text(serde_json::to_string(value)?))
}

fn profile_cell(profile: Option<&ProfileSummary>, column: &str) -> Result<SheetCell, ReportError> {
    let Some(profile) = profile else {
        return Ok(SheetCell::Empty);
    };
    let text = |value: Option<&String>| {
        non_blank(value).map_or(SheetCell::Empty, |s| SheetCell::Text(s.to_string()))
    };
    let year = |pick: fn(&AssetFacts) -> Option<i32>| {
        profile
            .assets
            .as_ref()
            .and_then(pick)
            .map_or(SheetCell::Empty, |y| SheetCell::Number(f64::from(y)))
    };
    let claims = profile.claims.as_ref();
    let list = |pick: fn(&ClaimFacts) -> &Vec<String>| match claims {
        Some(facts) => json_text(pick(facts)),
        None => Ok(SheetCell::Empty),
    };

    let identity = &profile.identity;
    let cell = match column {
        "identifier_email" => SheetCell::Text(identity.identifier_email.clone()),
        "displayname" => text(identity.displayname.as_ref()),
        "jobtitle" => text(identity.jobtitle.as_ref()),
        "organization_name" => text(identity.organization_name.as_ref()),
        "organization_uri" => text(identity.organization_uri.as_ref()),
        "url" => text(identity.url.as_ref()),
        "scientific_assets_summary" => match &profile.assets {
            Some(facts) => json_text(&facts.scientific_assets_summary)?,
            None => SheetCell::Empty,
        },
        "first_year_published" => year(|a| a.first_year_published),
        "last_year_published" => year(|a| a.last_year_published),
        "job_titles" => list(|c| &c.job_titles)?,
        "organization_affiliations" => list(|c| &c.organization_affiliations)?,
        "expertise_terms" => list(|c| &c.expertise_terms)?,
        "metadata_keywords" => list(|c| &c.metadata_keywords)?,
        "distinct_coauthors" => claims
            .map_or(SheetCell::Empty, |c| SheetCell::Number(c.distinct_coauthors as f64)),
        other => {
            return Err(ReportError::Arrow(ArrowError::InvalidArgumentError(format!(
                "unknown profile column {other}"
            ))))
        }
    };
    Ok(cell)
}

fn write_survey_cell(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: &CellValue,
    timestamp: &Format,
) -> Result<(), XlsxError> {
    match value {
        CellValue::Null => {}
        CellValue::Text(text) => {
            sheet.write_string(row, col, text)?;
        }
        CellValue::Number(n) => {
            sheet.write_number(row, col, *n)?;
        }
        CellValue::Timestamp(ts) => {
            sheet.write_number_with_format(row, col, excel_serial(ts), timestamp)?;
        }
    }
    Ok(())
}

/// Render the enriched table as a single-sheet workbook: one header row, then
/// one row per response. Null values leave the cell empty.
pub fn encode_xlsx(
    survey_properties: &[String],
    rows: &[EnrichedRow<'_>],
) -> Result<Vec<u8>, ReportError> {
    let (survey_names, profile_names) = output_names(survey_properties);
    let timestamp = Format::new().set_num_format(TIMESTAMP_FORMAT);

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, name) in survey_names.iter().chain(&profile_names).enumerate() {
        sheet.write_string(0, col as u16, name)?;
    }

    for (idx, enriched) in rows.iter().enumerate() {
        let row = idx as u32 + 1;
        for (col, property) in survey_properties.iter().enumerate() {
            let value = enriched.response.get(property);
            write_survey_cell(sheet, row, col as u16, value, &timestamp)?;
        }
        for (offset, column) in PROFILE_COLUMNS.iter().enumerate() {
            let col = (survey_properties.len() + offset) as u16;
            match profile_cell(enriched.profile, column)? {
                SheetCell::Empty => {}
                SheetCell::Text(text) => {
                    sheet.write_string(row, col, text)?;
                }
                SheetCell::Number(n) => {
                    sheet.write_number(row, col, n)?;
                }
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}

/// Encode and write the report, replacing any existing file at `path`.
pub async fn write_report(
    path: &Path,
    format: ReportFormat,
    survey_properties: &[String],
    rows: &[EnrichedRow<'_>],
) -> Result<ReportSummary, ReportError> {
    let bytes = match format {
        ReportFormat::Xlsx => encode_xlsx(survey_properties, rows)?,
        ReportFormat::Parquet => encode_parquet(&build_record_batch(survey_properties, rows)?)?,
    };
    let written = write_atomic(path, &bytes)
        .await
        .map_err(|err| ReportError::Write {
            path: path.to_path_buf(),
            message: format!("{err:#}"),
        })?;

    let summary = ReportSummary {
        path: written.path.display().to_string(),
        format,
        rows: rows.len(),
        columns: survey_properties.len() + PROFILE_COLUMNS.len(),
        matched_rows: rows.iter().filter(|row| row.profile.is_some()).count(),
        sha256: written.content_hash,
        bytes: written.byte_size,
    };
    info!(
        path = %summary.path,
        format = format.extension(),
        rows = summary.rows,
        matched = summary.matched_rows,
        sha256 = %summary.sha256,
        "wrote enriched report"
    );
    Ok(summary)
}
