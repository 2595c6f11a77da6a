use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use time::{Month, OffsetDateTime, UtcOffset};

pub const RECORD_ID_COLUMN: &str = "Record ID";

pub const ARCHETYPE_COLOURS: [&str; 10] = [
    "Purple", "Green", "Blue", "Maroon", "Yellow", "Orange", "Pink", "Red", "Silver", "Beige",
];

pub const PERCENTAGE_TOTAL: i64 = 100;

pub const INSTITUTION_TYPES: &[&str] = &["Community College", "Private", "Public", "School", "Other"];

pub const NARRATIVE_VOICES: &[&str] = &[
    "Aspirational",
    "Authoritative",
    "Conversational",
    "Inspirational",
    "Other",
];

pub const WEB_DESIGN_LAYOUTS: &[&str] = &["Minimal", "Grid", "Editorial", "Immersive", "Other"];

pub const WEB_IMAGERY_STYLES: &[&str] = &[
    "Candid Photography",
    "Staged Photography",
    "Illustration",
    "Mixed",
    "Other",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("percentage total must equal 100 for {form}, got {total}")]
    PercentageSum { form: FormKind, total: i64 },
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = LedgerError;

    /// Parses a stored record id. Zero is reserved for "new record" submissions
    /// and never identifies a row.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw
            .trim()
            .parse::<u64>()
            .map_err(|err| LedgerError::Validation(format!("invalid record id {raw:?}: {err}")))?;
        if value == 0 {
            return Err(LedgerError::Validation(
                "record id MUST be >= 1".to_string(),
            ));
        }
        Ok(Self(value))
    }
}

/// Month granularity date used for the analysis date column (`YYYY-MM`).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AnalysisMonth {
    year: i32,
    month: u8,
}

impl AnalysisMonth {
    /// Builds a month from calendar components.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the year is outside
    /// `1..=9999` or the month outside `1..=12`.
    pub fn new(year: i32, month: u8) -> Result<Self, LedgerError> {
        if !(1..=9999).contains(&year) {
            return Err(LedgerError::Validation(format!(
                "year MUST be in [1, 9999], got {year}"
            )));
        }
        Month::try_from(month)
            .map_err(|err| LedgerError::Validation(format!("invalid month {month}: {err}")))?;
        Ok(Self { year, month })
    }

    #[must_use]
    pub fn from_datetime(value: OffsetDateTime) -> Self {
        let utc = value.to_offset(UtcOffset::UTC);
        Self {
            year: utc.year(),
            month: u8::from(utc.month()),
        }
    }

    #[must_use]
    pub fn current() -> Self {
        Self::from_datetime(now_utc())
    }

    #[must_use]
    pub fn year(self) -> i32 {
        self.year
    }

    #[must_use]
    pub fn month(self) -> u8 {
        self.month
    }
}

impl Display for AnalysisMonth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for AnalysisMonth {
    type Err = LedgerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || LedgerError::Validation(format!("month must be YYYY-MM, got {raw:?}"));
        let (year, month) = raw.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4
            || month.len() != 2
            || !year.bytes().all(|b| b.is_ascii_digit())
            || !month.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u8>().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl Serialize for AnalysisMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A typed cell value. Absence of a key in a record is the null cell.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Month(AnalysisMonth),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Recovers a typed value from its serialized text.
    ///
    /// Only strings that re-render byte-for-byte are promoted to integers or
    /// months, so `infer(value.to_string())` never changes what a cell shows.
    /// Text that is itself a canonical integer or month (`"2024"`, `"2024-06"`)
    /// comes back as that type. The empty string is the null cell.
    #[must_use]
    pub fn infer(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        if let Ok(value) = raw.parse::<i64>() {
            if value.to_string() == raw {
                return Some(Self::Integer(value));
            }
        }
        if let Ok(month) = raw.parse::<AnalysisMonth>() {
            if month.to_string() == raw {
                return Some(Self::Month(month));
            }
        }
        Some(Self::Text(raw.to_string()))
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Integer(value) => Value::from(*value),
            Self::Month(month) => Value::String(month.to_string()),
            Self::Text(text) => Value::String(text.clone()),
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Month(month) => write!(f, "{month}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AnalysisRecord {
    pub record_id: RecordId,
    pub fields: BTreeMap<String, FieldValue>,
}

impl AnalysisRecord {
    #[must_use]
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct UpsertOutcome {
    pub action: UpsertAction,
    pub record_id: RecordId,
    pub columns_added: Vec<String>,
}

/// The whole dataset: ordered columns (`Record ID` first) and rows keyed by
/// record id. The column list only ever grows.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AnalysisTable {
    columns: Vec<String>,
    records: Vec<AnalysisRecord>,
}

impl Default for AnalysisTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl AnalysisTable {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            columns: vec![RECORD_ID_COLUMN.to_string()],
            records: Vec::new(),
        }
    }

    /// Assembles a table from decoded columns and records.
    ///
    /// `Record ID` is moved to (or inserted at) the front of the column list.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for empty or duplicate column
    /// names, duplicate record ids, or record fields missing from `columns`.
    pub fn from_parts(
        columns: Vec<String>,
        records: Vec<AnalysisRecord>,
    ) -> Result<Self, LedgerError> {
        let mut ordered = vec![RECORD_ID_COLUMN.to_string()];
        let mut seen = BTreeSet::new();
        for column in columns {
            if column.is_empty() {
                return Err(LedgerError::Validation(
                    "column names MUST be non-empty".to_string(),
                ));
            }
            if !seen.insert(column.clone()) {
                return Err(LedgerError::Validation(format!(
                    "duplicate column {column:?}"
                )));
            }
            if column != RECORD_ID_COLUMN {
                ordered.push(column);
            }
        }

        let mut ids = BTreeSet::new();
        for record in &records {
            if record.record_id.0 == 0 {
                return Err(LedgerError::Validation(
                    "record id MUST be >= 1".to_string(),
                ));
            }
            if !ids.insert(record.record_id) {
                return Err(LedgerError::Validation(format!(
                    "duplicate record id {}",
                    record.record_id
                )));
            }
            if let Some(unknown) = record.fields.keys().find(|name| !seen.contains(*name)) {
                return Err(LedgerError::Validation(format!(
                    "record {} has field {unknown:?} outside the column set",
                    record.record_id
                )));
            }
            if record.fields.contains_key(RECORD_ID_COLUMN) {
                return Err(LedgerError::Validation(format!(
                    "record {} stores {RECORD_ID_COLUMN:?} as a field",
                    record.record_id
                )));
            }
        }

        Ok(Self {
            columns: ordered,
            records,
        })
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn records(&self) -> &[AnalysisRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|name| name == column)
    }

    #[must_use]
    pub fn record(&self, record_id: RecordId) -> Option<&AnalysisRecord> {
        self.records.iter().find(|record| record.record_id == record_id)
    }

    #[must_use]
    pub fn max_record_id(&self) -> Option<RecordId> {
        self.records.iter().map(|record| record.record_id).max()
    }

    /// Id the next inserted record receives: `max(existing ids) + 1`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the largest stored id is
    /// `u64::MAX` and no further id can be minted.
    pub fn next_record_id(&self) -> Result<RecordId, LedgerError> {
        self.max_record_id()
            .map_or(0, |id| id.0)
            .checked_add(1)
            .map(RecordId)
            .ok_or_else(|| {
                LedgerError::Validation("record id space exhausted; cannot mint a new id".to_string())
            })
    }

    /// Renders one cell as text; null cells render as the empty string.
    #[must_use]
    pub fn cell(record: &AnalysisRecord, column: &str) -> String {
        if column == RECORD_ID_COLUMN {
            return record.record_id.to_string();
        }
        record
            .get(column)
            .map_or_else(String::new, ToString::to_string)
    }

    /// Inserts or merges one partial field set.
    ///
    /// With `record_id == 0` and `allow_create`, a row is appended under
    /// `max(existing ids) + 1` holding exactly `fields`. Otherwise the row with
    /// `record_id` gets each supplied field overwritten and keeps the rest.
    /// Unseen columns are appended to the schema. Every check runs before the
    /// first write, so an error leaves the table untouched.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for empty, reserved, or repeated
    /// field names or when no new id can be minted, and
    /// [`LedgerError::RecordNotFound`] when an update targets an id that is
    /// not in the table.
    pub fn apply(
        &mut self,
        record_id: u64,
        fields: &[(String, FieldValue)],
        allow_create: bool,
    ) -> Result<UpsertOutcome, LedgerError> {
        validate_field_names(fields)?;

        if record_id == 0 && allow_create {
            let new_id = self.next_record_id()?;
            let columns_added = self.extend_columns(fields);
            let mut record = AnalysisRecord::new(new_id);
            record.fields.extend(fields.iter().cloned());
            self.records.push(record);
            return Ok(UpsertOutcome {
                action: UpsertAction::Inserted,
                record_id: new_id,
                columns_added,
            });
        }

        let target = RecordId(record_id);
        let Some(index) = self
            .records
            .iter()
            .position(|record| record.record_id == target)
        else {
            return Err(LedgerError::RecordNotFound(target));
        };

        let columns_added = self.extend_columns(fields);
        let record = &mut self.records[index];
        for (name, value) in fields {
            record.fields.insert(name.clone(), value.clone());
        }

        Ok(UpsertOutcome {
            action: UpsertAction::Updated,
            record_id: target,
            columns_added,
        })
    }

    /// Returns the rows whose rendered `column` equals `value`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `column` is unknown.
    pub fn filter(&self, column: &str, value: &str) -> Result<Self, LedgerError> {
        self.require_column(column)?;
        Ok(Self {
            columns: self.columns.clone(),
            records: self
                .records
                .iter()
                .filter(|record| Self::cell(record, column) == value)
                .cloned()
                .collect(),
        })
    }

    /// Sorted distinct rendered values of `column`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when `column` is unknown.
    pub fn distinct_values(&self, column: &str) -> Result<Vec<String>, LedgerError> {
        self.require_column(column)?;
        Ok(self
            .records
            .iter()
            .map(|record| Self::cell(record, column))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    #[must_use]
    pub fn to_json_rows(&self) -> Vec<Value> {
        self.records
            .iter()
            .map(|record| Value::Object(self.record_to_json(record)))
            .collect()
    }

    #[must_use]
    pub fn record_to_json(&self, record: &AnalysisRecord) -> Map<String, Value> {
        let mut row = Map::new();
        for column in &self.columns {
            let value = if column == RECORD_ID_COLUMN {
                Value::from(record.record_id.0)
            } else {
                record.get(column).map_or(Value::Null, FieldValue::to_json)
            };
            row.insert(column.clone(), value);
        }
        row
    }

    fn require_column(&self, column: &str) -> Result<(), LedgerError> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(LedgerError::Validation(format!("unknown column {column:?}")))
        }
    }

    fn extend_columns(&mut self, fields: &[(String, FieldValue)]) -> Vec<String> {
        let mut added = Vec::new();
        for (name, _) in fields {
            if !self.has_column(name) {
                self.columns.push(name.clone());
                added.push(name.clone());
            }
        }
        added
    }
}

fn validate_field_names(fields: &[(String, FieldValue)]) -> Result<(), LedgerError> {
    let mut seen = BTreeSet::new();
    for (name, _) in fields {
        if name.trim().is_empty() {
            return Err(LedgerError::Validation(
                "field names MUST be non-empty".to_string(),
            ));
        }
        if name == RECORD_ID_COLUMN {
            return Err(LedgerError::Validation(format!(
                "{RECORD_ID_COLUMN:?} is assigned by the store and cannot be submitted"
            )));
        }
        if !seen.insert(name.as_str()) {
            return Err(LedgerError::Validation(format!(
                "field {name:?} supplied more than once"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FormKind {
    InstitutionInfo,
    NarrativeArchetypes,
    WebDesignArchetypes,
    WebImageryArchetypes,
    NarrativeNotes,
    WebDesignNotes,
    WebImageryNotes,
}

impl FormKind {
    pub const ALL: [Self; 7] = [
        Self::InstitutionInfo,
        Self::NarrativeArchetypes,
        Self::WebDesignArchetypes,
        Self::WebImageryArchetypes,
        Self::NarrativeNotes,
        Self::WebDesignNotes,
        Self::WebImageryNotes,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstitutionInfo => "institution_info",
            Self::NarrativeArchetypes => "narrative_archetypes",
            Self::WebDesignArchetypes => "web_design_archetypes",
            Self::WebImageryArchetypes => "web_imagery_archetypes",
            Self::NarrativeNotes => "narrative_notes",
            Self::WebDesignNotes => "web_design_notes",
            Self::WebImageryNotes => "web_imagery_notes",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::InstitutionInfo => "Institution Info",
            Self::NarrativeArchetypes => "Narrative Archetyping",
            Self::WebDesignArchetypes => "Web Design Archetyping",
            Self::WebImageryArchetypes => "Web Imagery Archetyping",
            Self::NarrativeNotes => "Narrative Notetaking",
            Self::WebDesignNotes => "Web Design Notetaking",
            Self::WebImageryNotes => "Web Imagery Notetaking",
        }
    }

    /// Only the institution info form may mint a new record id.
    #[must_use]
    pub fn allows_create(self) -> bool {
        matches!(self, Self::InstitutionInfo)
    }

    #[must_use]
    pub fn spec(self) -> FormSpec {
        let fields = match self {
            Self::InstitutionInfo => {
                let mut fields = vec![
                    FieldSpec::new("Full Name", FieldKind::Text),
                    FieldSpec::new("Abbreviation", FieldKind::Text),
                    FieldSpec::new("Type", FieldKind::Choice(INSTITUTION_TYPES)),
                    FieldSpec::new("Analysis Date", FieldKind::Month),
                    FieldSpec::new("Client Institution", FieldKind::Text),
                    FieldSpec::new("Website URL", FieldKind::Text),
                ];
                fields.extend(archetype_fields(None));
                fields
            }
            Self::NarrativeArchetypes => archetype_fields(None).collect(),
            Self::WebDesignArchetypes => archetype_fields(Some("Web Design")).collect(),
            Self::WebImageryArchetypes => archetype_fields(Some("Web Imagery")).collect(),
            Self::NarrativeNotes => vec![
                FieldSpec::new("Narrative Tagline", FieldKind::Text),
                FieldSpec::new("Narrative Voice", FieldKind::Choice(NARRATIVE_VOICES)),
                FieldSpec::new("Narrative Notes", FieldKind::Text),
            ],
            Self::WebDesignNotes => vec![
                FieldSpec::new("Web Design Layout", FieldKind::Choice(WEB_DESIGN_LAYOUTS)),
                FieldSpec::new("Web Design Palette", FieldKind::Text),
                FieldSpec::new("Web Design Notes", FieldKind::Text),
            ],
            Self::WebImageryNotes => vec![
                FieldSpec::new("Web Imagery Subjects", FieldKind::Text),
                FieldSpec::new("Web Imagery Style", FieldKind::Choice(WEB_IMAGERY_STYLES)),
                FieldSpec::new("Web Imagery Notes", FieldKind::Text),
            ],
        };

        FormSpec {
            form: self,
            title: self.title(),
            allows_create: self.allows_create(),
            fields,
        }
    }
}

impl Display for FormKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column name of one archetype percentage. Narrative archetypes use the bare
/// colour, matching the legacy dataset layout.
#[must_use]
pub fn archetype_column(prefix: Option<&str>, colour: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix} {colour}"),
        None => colour.to_string(),
    }
}

fn archetype_fields(prefix: Option<&str>) -> impl Iterator<Item = FieldSpec> + '_ {
    ARCHETYPE_COLOURS
        .into_iter()
        .map(move |colour| FieldSpec::new(archetype_column(prefix, colour), FieldKind::Percentage))
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "options")]
pub enum FieldKind {
    Text,
    Choice(&'static [&'static str]),
    Percentage,
    Month,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct FormSpec {
    pub form: FormKind,
    pub title: &'static str,
    pub allows_create: bool,
    pub fields: Vec<FieldSpec>,
}

impl FormSpec {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn percentage_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields
            .iter()
            .filter(|field| field.kind == FieldKind::Percentage)
    }
}

/// One form submit: the target record (`0` requests a new record) and the
/// named values the form collected.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FormSubmission {
    pub form: FormKind,
    pub record_id: u64,
    pub fields: Vec<(String, FieldValue)>,
}

impl FormSubmission {
    #[must_use]
    pub fn new(form: FormKind, record_id: u64) -> Self {
        Self {
            form,
            record_id,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Sum of the integer values supplied for the form's percentage fields.
    #[must_use]
    pub fn percentage_total(&self) -> i64 {
        self.form
            .spec()
            .percentage_fields()
            .filter_map(|field| self.field(&field.name).and_then(FieldValue::as_integer))
            .sum()
    }

    /// Validates the submission against its form before any write.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for unknown, repeated, or
    /// mistyped fields and missing percentages, and
    /// [`LedgerError::PercentageSum`] when the form's percentages do not total
    /// exactly 100.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let spec = self.form.spec();
        let mut seen = BTreeSet::new();

        for (name, value) in &self.fields {
            if !seen.insert(name.as_str()) {
                return Err(LedgerError::Validation(format!(
                    "field {name:?} supplied more than once"
                )));
            }
            let Some(field) = spec.field(name) else {
                return Err(LedgerError::Validation(format!(
                    "field {name:?} is not part of {}",
                    self.form
                )));
            };

            match (field.kind, value) {
                (FieldKind::Text, _) | (FieldKind::Month, FieldValue::Month(_)) => {}
                (FieldKind::Choice(options), value) => {
                    let rendered = value.to_string();
                    if !options.contains(&rendered.as_str()) {
                        return Err(LedgerError::Validation(format!(
                            "{name} MUST be one of [{}], got {rendered:?}",
                            options.join(", ")
                        )));
                    }
                }
                (FieldKind::Percentage, FieldValue::Integer(percent))
                    if (0..=PERCENTAGE_TOTAL).contains(percent) => {}
                (FieldKind::Percentage, other) => {
                    return Err(LedgerError::Validation(format!(
                        "{name} MUST be an integer in [0, {PERCENTAGE_TOTAL}], got {other}"
                    )));
                }
                (FieldKind::Month, other) => {
                    return Err(LedgerError::Validation(format!(
                        "{name} MUST be a YYYY-MM month, got {other}"
                    )));
                }
            }
        }

        let mut has_percentages = false;
        for field in spec.percentage_fields() {
            has_percentages = true;
            if !seen.contains(field.name.as_str()) {
                return Err(LedgerError::Validation(format!(
                    "percentage field {:?} is required for {}",
                    field.name, self.form
                )));
            }
        }

        if has_percentages {
            let total = self.percentage_total();
            if total != PERCENTAGE_TOTAL {
                return Err(LedgerError::PercentageSum {
                    form: self.form,
                    total,
                });
            }
        }

        Ok(())
    }
}

/// Validates `submission` and applies it to `table`.
///
/// # Errors
/// Propagates validation failures and [`LedgerError::RecordNotFound`]; the
/// table is unchanged on every error.
pub fn apply_submission(
    table: &mut AnalysisTable,
    submission: &FormSubmission,
) -> Result<UpsertOutcome, LedgerError> {
    submission.validate()?;
    table.apply(
        submission.record_id,
        &submission.fields,
        submission.form.allows_create(),
    )
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
