//! Event records that flow between pipeline stages.
//!
//! A run starts with [`RawEvent`]s from the extractor, collects one
//! annotation of each kind per event, and ends with [`ValidatedEvent`]s
//! ready for graph placement.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A candidate life event cut out of the narrative, before annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// The excerpt of the narrative this event was read from.
    pub source_span: String,
    /// Position of the event in the source text (0-based).
    pub mention_order: usize,
    /// The temporal expression found in the span, if any ("in 2020", "last summer").
    pub raw_temporal_reference: Option<String>,
}

impl RawEvent {
    pub fn new(
        source_span: impl Into<String>,
        mention_order: usize,
        raw_temporal_reference: Option<String>,
    ) -> Self {
        Self {
            source_span: source_span.into(),
            mention_order,
            raw_temporal_reference,
        }
    }

    /// An event without a usable source span cannot be traced back to the
    /// narrative and is dropped by the validator.
    pub fn is_malformed(&self) -> bool {
        self.source_span.trim().is_empty()
    }
}

/// How much of a resolved date is actually known.
///
/// Variants are ordered from least to most precise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatePrecision {
    Unknown,
    Year,
    Month,
    Day,
}

impl fmt::Display for DatePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatePrecision::Unknown => "unknown",
            DatePrecision::Year => "year",
            DatePrecision::Month => "month",
            DatePrecision::Day => "day",
        };
        f.write_str(name)
    }
}

impl DatePrecision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "day" => Some(DatePrecision::Day),
            "month" => Some(DatePrecision::Month),
            "year" => Some(DatePrecision::Year),
            "unknown" => Some(DatePrecision::Unknown),
            _ => None,
        }
    }
}

/// A calendar date with its precision and the resolver's confidence in it.
///
/// The date is always the first day of the period the precision covers:
/// a year-precision date is January 1st, a month-precision date is the 1st.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedDate {
    #[serde(with = "iso_date")]
    pub date: NaiveDate,
    pub precision: DatePrecision,
    /// 0.0 (a placeholder) to 1.0 (stated verbatim in the text).
    pub confidence: f32,
}

impl ResolvedDate {
    pub fn new(date: NaiveDate, precision: DatePrecision, confidence: f32) -> Self {
        Self {
            date: truncate_to_precision(date, precision),
            precision,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// A placeholder date for an event whose time could not be resolved.
    pub fn unknown(anchor: NaiveDate) -> Self {
        Self {
            date: anchor,
            precision: DatePrecision::Unknown,
            confidence: 0.0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.precision == DatePrecision::Unknown
    }

    /// Lower the precision to at most `cap`, never raising it.
    pub fn capped(self, cap: DatePrecision) -> Self {
        if self.precision <= cap {
            return self;
        }
        if cap == DatePrecision::Unknown {
            return Self::unknown(self.date);
        }
        Self::new(self.date, cap, self.confidence)
    }
}

/// Snap a date to the start of the period its precision describes.
pub fn truncate_to_precision(date: NaiveDate, precision: DatePrecision) -> NaiveDate {
    use chrono::Datelike;
    match precision {
        DatePrecision::Day | DatePrecision::Unknown => date,
        DatePrecision::Month => date.with_day(1).unwrap_or(date),
        DatePrecision::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
    }
}

/// Display text for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitLabel {
    /// Short, imperative commit subject. Bounded in length.
    pub short_message: String,
    /// Long-form body. Unbounded.
    pub long_description: String,
    /// The source spans this label was written from, verbatim.
    pub provenance: Vec<String>,
}

/// Whether an event is a life change big enough to get its own branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSignal {
    pub is_major_change: bool,
    /// Short thematic label such as "career" or "relocation".
    pub suggested_branch_name: Option<String>,
}

impl BranchSignal {
    pub fn main_line() -> Self {
        Self::default()
    }

    pub fn major(name: impl Into<String>) -> Self {
        Self {
            is_major_change: true,
            suggested_branch_name: Some(name.into()),
        }
    }
}

/// A branch name, unique within one timeline. Always a git-ref-safe slug.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchName(String);

impl BranchName {
    pub const MAIN: &'static str = "main";

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    /// Wrap an already-slugged name.
    pub(crate) fn from_slug(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_main(&self) -> bool {
        self.0 == Self::MAIN
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, `[a-z0-9-]` only, dashes collapsed and trimmed.
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for c in label.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// A fully annotated event, ready for placement in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedEvent {
    pub raw: RawEvent,
    pub date: ResolvedDate,
    pub label: CommitLabel,
    pub is_major_change: bool,
    /// Set exactly when `is_major_change` is true.
    pub branch: Option<BranchName>,
    /// Files the event was discovered in, for pre-supplied candidates.
    pub source_files: Vec<String>,
}

/// Document-level temporal context supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemporalAnchor {
    /// Lets "when I was 22" resolve to a year.
    #[serde(default, with = "iso_date::option")]
    pub birth_date: Option<NaiveDate>,
    /// When the narrative was written. Lets "last year" resolve.
    #[serde(default, with = "iso_date::option")]
    pub reference_date: Option<NaiveDate>,
}

impl TemporalAnchor {
    pub fn with_birth_date(mut self, date: NaiveDate) -> Self {
        self.birth_date = Some(date);
        self
    }

    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }
}

/// A pre-extracted event from an external discovery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateEvent {
    #[serde(alias = "commit_message")]
    pub message: String,
    /// `YYYY-MM-DD`, `YYYY-MM` or `YYYY`; anything else resolves as unknown.
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_major_change: bool,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub source_files: Vec<String>,
}

/// Everything a caller hands to the engine for one timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineRequest {
    pub text: String,
    #[serde(default)]
    pub anchor: Option<TemporalAnchor>,
    #[serde(default)]
    pub candidates: Vec<CandidateEvent>,
}

impl TimelineRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_anchor(mut self, anchor: TemporalAnchor) -> Self {
        self.anchor = Some(anchor);
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<CandidateEvent>) -> Self {
        self.candidates = candidates;
        self
    }

    /// True when the narrative text has nothing to extract from.
    pub fn has_blank_text(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// `YYYY-MM-DD` (de)serialization for `NaiveDate`.
pub(crate) mod iso_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d";

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveDate::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::FORMAT;
        use chrono::NaiveDate;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            date: &Option<NaiveDate>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match date {
                Some(d) => serializer.serialize_str(&d.format(FORMAT).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveDate>, D::Error> {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| NaiveDate::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
