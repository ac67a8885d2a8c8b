use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{AppError, AppResult};
use crate::fields::{self, canonical, ImportKind};

/// Extra key carried inside the submitted mapping when date and time share a
/// single source column; the backend splits the column downstream.
pub const COMBINED_FORMAT_KEY: &str = "formato_fecha_hora";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateTimeFormat {
    DayMonthYearSlash,
    YearMonthDayDash,
    DayMonthYearDash,
    MonthDayYearSlash,
    YearMonthDaySlash,
}

impl DateTimeFormat {
    pub const ALL: [DateTimeFormat; 5] = [
        DateTimeFormat::DayMonthYearSlash,
        DateTimeFormat::YearMonthDayDash,
        DateTimeFormat::DayMonthYearDash,
        DateTimeFormat::MonthDayYearSlash,
        DateTimeFormat::YearMonthDaySlash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DateTimeFormat::DayMonthYearSlash => "DD/MM/YYYY HH:mm:ss",
            DateTimeFormat::YearMonthDayDash => "YYYY-MM-DD HH:mm:ss",
            DateTimeFormat::DayMonthYearDash => "DD-MM-YYYY HH:mm:ss",
            DateTimeFormat::MonthDayYearSlash => "MM/DD/YYYY HH:mm:ss",
            DateTimeFormat::YearMonthDaySlash => "YYYY/MM/DD HH:mm:ss",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == value.trim())
            .ok_or_else(|| AppError::Config(format!("unsupported date/time format: {value}")))
    }
}

impl Default for DateTimeFormat {
    fn default() -> Self {
        DateTimeFormat::DayMonthYearSlash
    }
}

/// Canonical-field → source-header assignment for one import attempt.
///
/// Created by the auto-mapper, then edited by hand, consumed once at
/// submission. Dropped whenever the file or the kind changes.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    kind: ImportKind,
    assignments: HashMap<&'static str, Option<String>>,
    combined_format: Option<DateTimeFormat>,
}

impl ColumnMapping {
    pub fn new(kind: ImportKind) -> Self {
        let assignments = fields::all_fields(kind)
            .into_iter()
            .map(|field| (field, None))
            .collect();
        Self {
            kind,
            assignments,
            combined_format: None,
        }
    }

    /// Greedy single pass: for each field in priority order, the first
    /// unclaimed header whose lowercased value equals one of the field's
    /// aliases wins. A claim is never revisited, so an earlier field keeps
    /// its header even when a later field's alias list also contains it.
    pub fn auto_map(kind: ImportKind, headers: &[String]) -> Self {
        let mut mapping = Self::new(kind);
        let mut claimed: HashSet<String> = HashSet::new();
        for field in fields::all_fields(kind) {
            let Some(terms) = fields::aliases(field) else {
                continue;
            };
            for header in headers {
                let lowered = header.to_lowercase();
                if terms.contains(&lowered.as_str()) && !claimed.contains(&lowered) {
                    mapping.assignments.insert(field, Some(header.clone()));
                    claimed.insert(lowered);
                    break;
                }
            }
        }
        mapping
    }

    /// Exact-name matching for synthesized track payloads, whose headers are
    /// already canonical field names.
    pub fn auto_map_exact(kind: ImportKind, headers: &[String]) -> Self {
        let mut mapping = Self::new(kind);
        for field in fields::all_fields(kind) {
            if let Some(header) = headers.iter().find(|header| header.as_str() == field) {
                mapping.assignments.insert(field, Some(header.clone()));
            }
        }
        mapping
    }

    pub fn kind(&self) -> ImportKind {
        self.kind
    }

    /// Stale assignments from a different kind are never retained.
    pub fn reset_for(&mut self, kind: ImportKind) {
        *self = Self::new(kind);
    }

    pub fn header_for(&self, field: &str) -> Option<&str> {
        self.assignments
            .get(field)
            .and_then(|header| header.as_deref())
    }

    /// Manual override; not re-validated against the alias dictionary. With
    /// combined date+time active, assigning either date or time moves both.
    pub fn assign(&mut self, field: &str, header: &str) -> AppResult<()> {
        let field = self.resolve(field)?;
        if self.combined_format.is_some()
            && (field == canonical::FECHA || field == canonical::HORA)
        {
            self.assignments
                .insert(canonical::FECHA, Some(header.to_string()));
            self.assignments
                .insert(canonical::HORA, Some(header.to_string()));
        } else {
            self.assignments.insert(field, Some(header.to_string()));
        }
        Ok(())
    }

    pub fn clear(&mut self, field: &str) -> AppResult<()> {
        let field = self.resolve(field)?;
        if self.combined_format.is_some()
            && (field == canonical::FECHA || field == canonical::HORA)
        {
            self.assignments.insert(canonical::FECHA, None);
            self.assignments.insert(canonical::HORA, None);
        } else {
            self.assignments.insert(field, None);
        }
        Ok(())
    }

    /// Enabling forces date and time onto one shared source header.
    pub fn set_combined_format(&mut self, format: Option<DateTimeFormat>) {
        self.combined_format = format;
        if self.combined_format.is_some() {
            let shared = self
                .assignments
                .get(canonical::FECHA)
                .cloned()
                .unwrap_or(None);
            self.assignments.insert(canonical::HORA, shared);
        }
    }

    pub fn combined_format(&self) -> Option<DateTimeFormat> {
        self.combined_format
    }

    pub fn missing_required(&self) -> Vec<&'static str> {
        fields::required_fields(self.kind)
            .iter()
            .copied()
            .filter(|field| self.header_for(field).is_none())
            .collect()
    }

    /// Gates the submit action only, never the mapping editor.
    pub fn is_complete(&self) -> bool {
        self.missing_required().is_empty()
    }

    /// Non-null entries in field order, plus the combined-format key when
    /// active; the exact shape the backend parses out of `column_mapping`.
    pub fn submission_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for field in fields::all_fields(self.kind) {
            if let Some(header) = self.header_for(field) {
                map.insert(field.to_string(), Value::String(header.to_string()));
            }
        }
        if let Some(format) = self.combined_format {
            map.insert(
                COMBINED_FORMAT_KEY.to_string(),
                Value::String(format.as_str().to_string()),
            );
        }
        map
    }

    pub fn submission_json(&self) -> AppResult<String> {
        serde_json::to_string(&Value::Object(self.submission_map())).map_err(AppError::from)
    }

    fn resolve(&self, field: &str) -> AppResult<&'static str> {
        fields::all_fields(self.kind)
            .into_iter()
            .find(|candidate| *candidate == field)
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "unknown field '{field}' for kind {}",
                    self.kind.as_tag()
                ))
            })
    }
}

/// First record of a delimited file, trimmed, empties dropped, original
/// order preserved. An empty or headerless file is a terminal read error.
pub fn read_headers(bytes: &[u8]) -> AppResult<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let record = match reader.records().next() {
        Some(record) => record?,
        None => return Err(AppError::Parse("file is empty; no header row found".into())),
    };

    let headers: Vec<String> = record
        .iter()
        .map(|header| header.trim().to_string())
        .filter(|header| !header.is_empty())
        .collect();

    if headers.is_empty() {
        return Err(AppError::Parse(
            "file has no usable column headers".into(),
        ));
    }
    Ok(headers)
}
