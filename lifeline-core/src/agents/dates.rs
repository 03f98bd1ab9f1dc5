//! Date resolution.
//!
//! Temporal references are recognised by a small grammar of patterns. Each
//! pattern yields a [`TemporalExpr`]; absolute expressions resolve on their
//! own, relative ones need an anchor. Anchors stated in the narrative itself
//! ("I was born in 1990", a nearby "in 2020") win over the caller's
//! [`TemporalAnchor`].

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::debug;

use super::{events_for_prompt, AgentBackend, AgentRole, Annotations, Annotator, StageContext};
use crate::error::GenerationError;
use crate::generator::ModelCaller;
use crate::model::{DatePrecision, RawEvent, ResolvedDate, TemporalAnchor};

const SYSTEM_PROMPT: &str = include_str!("prompts/date_resolver.txt");

const CONFIDENCE_DAY: f32 = 0.95;
const CONFIDENCE_MONTH: f32 = 0.9;
const CONFIDENCE_YEAR: f32 = 0.85;
const CONFIDENCE_INTRA_DOCUMENT: f32 = 0.6;
const CONFIDENCE_EXTERNAL_ANCHOR: f32 = 0.5;

const MONTH: &str = r"(january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec)\.?";
const SEASON: &str = r"(spring|summer|fall|autumn|winter)";
const COUNT: &str = r"(\d{1,2}|an?|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve)";

/// A recognised temporal expression, before anchoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalExpr {
    /// Stated outright: "2021-03-04", "March 2021", "summer of 2019", "2020".
    Absolute { date: NaiveDate, precision: DatePrecision },
    /// "when I was 22". Needs a birth year.
    Age(i32),
    /// "3 years ago", "last year". Relative to when the narrative was written.
    YearsAgo(i32),
    /// "last summer". Relative to when the narrative was written.
    LastSeason(u32),
    /// "two years later", "the year before", "that summer". Relative to the
    /// nearest explicitly dated event.
    FromNarrative { years: i32, month: Option<u32> },
    /// "the following spring". Relative to the nearest explicitly dated event.
    NextSeason(u32),
}

impl TemporalExpr {
    /// The finest precision this expression can justify.
    pub fn precision(&self) -> DatePrecision {
        match self {
            TemporalExpr::Absolute { precision, .. } => *precision,
            TemporalExpr::LastSeason(_) | TemporalExpr::NextSeason(_) => DatePrecision::Month,
            TemporalExpr::FromNarrative { month: Some(_), .. } => DatePrecision::Month,
            _ => DatePrecision::Year,
        }
    }
}

type Parser = fn(&Captures<'_>) -> Option<TemporalExpr>;

fn rule(source: &str, parse: Parser) -> (Regex, Parser) {
    let regex = Regex::new(&format!("(?i){source}")).expect("valid temporal pattern");
    (regex, parse)
}

/// Ordered most specific first; on equal start positions the earlier wins.
static PATTERNS: Lazy<Vec<(Regex, Parser)>> = Lazy::new(|| {
    vec![
        rule(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b", parse_iso_day),
        rule(
            &format!(r"\b{MONTH}\s+(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}})\b"),
            parse_month_day_year,
        ),
        rule(
            &format!(r"\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?{MONTH}\s+(\d{{4}})\b"),
            parse_day_month_year,
        ),
        rule(&format!(r"\b{MONTH}\s+(?:of\s+)?(\d{{4}})\b"), parse_month_year),
        rule(r"\b(\d{4})-(\d{1,2})\b", parse_iso_month),
        rule(&format!(r"\b(?:the\s+)?{SEASON}\s+(?:of\s+)?(\d{{4}})\b"), parse_season_year),
        rule(r"\b(?:when I was|at (?:the )?age(?: of)?|aged)\s+(\d{1,2})\b", parse_age),
        rule(r"\bat (\d{1,2})(?: years old)?(?:,|\.|\s*$)", parse_age),
        rule(&format!(r"\b{COUNT}\s+years?\s+ago\b"), parse_years_ago),
        rule(r"\blast\s+year\b", |_| Some(TemporalExpr::YearsAgo(1))),
        rule(&format!(r"\blast\s+{SEASON}\b"), parse_last_season),
        rule(&format!(r"\b{COUNT}\s+years?\s+later\b"), parse_years_later),
        rule(r"\bthe\s+(?:next|following)\s+year\b", |_| {
            Some(TemporalExpr::FromNarrative { years: 1, month: None })
        }),
        rule(r"\bthe\s+(?:year before|previous year|prior year)\b", |_| {
            Some(TemporalExpr::FromNarrative { years: -1, month: None })
        }),
        rule(r"\b(?:that|the same)\s+year\b", |_| {
            Some(TemporalExpr::FromNarrative { years: 0, month: None })
        }),
        rule(&format!(r"\b(?:that|the same)\s+{SEASON}\b"), parse_that_season),
        rule(&format!(r"\bthe\s+(?:next|following)\s+{SEASON}\b"), parse_next_season),
        rule(r"\b(1[89]\d{2}|20\d{2})\b", parse_bare_year),
    ]
});

static BIRTH_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bI was born\b[^.!?\n]*?\b(1[89]\d{2}|20\d{2})\b").expect("valid birth regex")
});

/// Find the first temporal expression in `span`, returning its exact text.
pub fn find_temporal_reference(span: &str) -> Option<String> {
    scan(span).map(|(text, _)| text.to_string())
}

/// Parse a temporal reference into an expression.
pub fn parse_reference(reference: &str) -> Option<TemporalExpr> {
    scan(reference).map(|(_, expr)| expr)
}

/// Earliest match wins; ties go to the pattern listed first.
fn scan(text: &str) -> Option<(&str, TemporalExpr)> {
    let mut best: Option<(usize, &str, TemporalExpr)> = None;
    for (regex, parse) in PATTERNS.iter() {
        let found = regex
            .captures_iter(text)
            .find_map(|caps| parse(&caps).map(|expr| (caps, expr)));
        if let Some((caps, expr)) = found {
            if let Some(m) = caps.get(0) {
                if best.as_ref().map_or(true, |(start, _, _)| m.start() < *start) {
                    best = Some((m.start(), m.as_str().trim_end_matches([',', '.']).trim(), expr));
                }
            }
        }
    }
    best.map(|(_, text, expr)| (text, expr))
}

/// The finest precision a reference justifies. No reference at all caps at
/// year: a model may place an undated event in a year, never on a day.
pub fn reference_precision(reference: Option<&str>) -> DatePrecision {
    reference
        .and_then(parse_reference)
        .map(|expr| expr.precision())
        .unwrap_or(DatePrecision::Year)
}

/// Parse `YYYY-MM-DD`, `YYYY-MM` or `YYYY`.
pub fn parse_loose_date(s: &str) -> Option<(NaiveDate, DatePrecision)> {
    let parts: Vec<&str> = s.trim().split('-').collect();
    let num = |i: usize| parts.get(i).and_then(|p| p.parse::<u32>().ok());
    let year = parts.first().filter(|p| p.len() == 4)?.parse::<i32>().ok()?;
    match parts.len() {
        1 => NaiveDate::from_ymd_opt(year, 1, 1).map(|d| (d, DatePrecision::Year)),
        2 => NaiveDate::from_ymd_opt(year, num(1)?, 1).map(|d| (d, DatePrecision::Month)),
        3 => NaiveDate::from_ymd_opt(year, num(1)?, num(2)?).map(|d| (d, DatePrecision::Day)),
        _ => None,
    }
}

fn month_number(name: &str) -> Option<u32> {
    let name = name.trim_end_matches('.').to_lowercase();
    let month = match name.get(..3)? {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn season_month(name: &str) -> Option<u32> {
    match name.to_lowercase().as_str() {
        "spring" => Some(3),
        "summer" => Some(6),
        "fall" | "autumn" => Some(9),
        "winter" => Some(12),
        _ => None,
    }
}

fn count(word: &str) -> Option<i32> {
    if let Ok(n) = word.parse::<i32>() {
        return Some(n);
    }
    let n = match word.to_lowercase().as_str() {
        "a" | "an" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        _ => return None,
    };
    Some(n)
}

fn group<'t>(caps: &Captures<'t>, i: usize) -> Option<&'t str> {
    caps.get(i).map(|m| m.as_str())
}

fn absolute(year: i32, month: u32, day: u32, precision: DatePrecision) -> Option<TemporalExpr> {
    NaiveDate::from_ymd_opt(year, month, day).map(|date| TemporalExpr::Absolute { date, precision })
}

fn parse_iso_day(caps: &Captures<'_>) -> Option<TemporalExpr> {
    absolute(
        group(caps, 1)?.parse().ok()?,
        group(caps, 2)?.parse().ok()?,
        group(caps, 3)?.parse().ok()?,
        DatePrecision::Day,
    )
}

fn parse_month_day_year(caps: &Captures<'_>) -> Option<TemporalExpr> {
    absolute(
        group(caps, 3)?.parse().ok()?,
        month_number(group(caps, 1)?)?,
        group(caps, 2)?.parse().ok()?,
        DatePrecision::Day,
    )
}

fn parse_day_month_year(caps: &Captures<'_>) -> Option<TemporalExpr> {
    absolute(
        group(caps, 3)?.parse().ok()?,
        month_number(group(caps, 2)?)?,
        group(caps, 1)?.parse().ok()?,
        DatePrecision::Day,
    )
}

fn parse_month_year(caps: &Captures<'_>) -> Option<TemporalExpr> {
    absolute(
        group(caps, 2)?.parse().ok()?,
        month_number(group(caps, 1)?)?,
        1,
        DatePrecision::Month,
    )
}

fn parse_iso_month(caps: &Captures<'_>) -> Option<TemporalExpr> {
    absolute(
        group(caps, 1)?.parse().ok()?,
        group(caps, 2)?.parse().ok()?,
        1,
        DatePrecision::Month,
    )
}

fn parse_season_year(caps: &Captures<'_>) -> Option<TemporalExpr> {
    absolute(
        group(caps, 2)?.parse().ok()?,
        season_month(group(caps, 1)?)?,
        1,
        DatePrecision::Month,
    )
}

fn parse_bare_year(caps: &Captures<'_>) -> Option<TemporalExpr> {
    absolute(group(caps, 1)?.parse().ok()?, 1, 1, DatePrecision::Year)
}

fn parse_age(caps: &Captures<'_>) -> Option<TemporalExpr> {
    group(caps, 1)?.parse().ok().map(TemporalExpr::Age)
}

fn parse_years_ago(caps: &Captures<'_>) -> Option<TemporalExpr> {
    count(group(caps, 1)?).map(TemporalExpr::YearsAgo)
}

fn parse_last_season(caps: &Captures<'_>) -> Option<TemporalExpr> {
    season_month(group(caps, 1)?).map(TemporalExpr::LastSeason)
}

fn parse_years_later(caps: &Captures<'_>) -> Option<TemporalExpr> {
    count(group(caps, 1)?).map(|years| TemporalExpr::FromNarrative { years, month: None })
}

fn parse_that_season(caps: &Captures<'_>) -> Option<TemporalExpr> {
    season_month(group(caps, 1)?).map(|month| TemporalExpr::FromNarrative {
        years: 0,
        month: Some(month),
    })
}

fn parse_next_season(caps: &Captures<'_>) -> Option<TemporalExpr> {
    season_month(group(caps, 1)?).map(TemporalExpr::NextSeason)
}

/// What one run knows about time besides the events themselves.
struct Anchors {
    /// Dates stated outright, indexed like the events.
    explicit: Vec<Option<NaiveDate>>,
    /// Birth year and whether it came from the narrative itself.
    birth_year: Option<(i32, bool)>,
    reference_date: Option<NaiveDate>,
}

impl Anchors {
    fn collect(exprs: &[Option<TemporalExpr>], text: &str, anchor: Option<&TemporalAnchor>) -> Self {
        let explicit = exprs
            .iter()
            .map(|expr| match expr {
                Some(TemporalExpr::Absolute { date, .. }) => Some(*date),
                _ => None,
            })
            .collect();

        let stated_birth = BIRTH_YEAR
            .captures(text)
            .and_then(|caps| group(&caps, 1)?.parse::<i32>().ok());
        let birth_year = stated_birth.map(|y| (y, true)).or_else(|| {
            anchor
                .and_then(|a| a.birth_date)
                .map(|d| (d.year(), false))
        });

        Self {
            explicit,
            birth_year,
            reference_date: anchor.and_then(|a| a.reference_date),
        }
    }

    /// The explicitly dated event closest in mention order; ties go to the
    /// earlier one.
    fn nearest_explicit(&self, index: usize) -> Option<NaiveDate> {
        (1..self.explicit.len()).find_map(|distance| {
            let before = index
                .checked_sub(distance)
                .and_then(|i| self.explicit.get(i).copied().flatten());
            before.or_else(|| self.explicit.get(index + distance).copied().flatten())
        })
    }

    /// Base date for narrative-relative expressions, with its confidence.
    fn narrative_base(&self, index: usize) -> Option<(NaiveDate, f32)> {
        self.nearest_explicit(index)
            .map(|d| (d, CONFIDENCE_INTRA_DOCUMENT))
            .or_else(|| self.reference_date.map(|d| (d, CONFIDENCE_EXTERNAL_ANCHOR)))
    }

    fn resolve(&self, index: usize, expr: TemporalExpr) -> Option<ResolvedDate> {
        match expr {
            TemporalExpr::Absolute { date, precision } => {
                let confidence = match precision {
                    DatePrecision::Day => CONFIDENCE_DAY,
                    DatePrecision::Month => CONFIDENCE_MONTH,
                    _ => CONFIDENCE_YEAR,
                };
                Some(ResolvedDate::new(date, precision, confidence))
            }
            TemporalExpr::Age(age) => {
                let (year, stated) = self.birth_year?;
                let confidence = if stated {
                    CONFIDENCE_INTRA_DOCUMENT
                } else {
                    CONFIDENCE_EXTERNAL_ANCHOR
                };
                year_start(year + age).map(|d| ResolvedDate::new(d, DatePrecision::Year, confidence))
            }
            TemporalExpr::YearsAgo(years) => {
                let now = self.reference_date?;
                year_start(now.year() - years)
                    .map(|d| ResolvedDate::new(d, DatePrecision::Year, CONFIDENCE_EXTERNAL_ANCHOR))
            }
            TemporalExpr::LastSeason(month) => {
                let now = self.reference_date?;
                let year = if month < now.month() { now.year() } else { now.year() - 1 };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .map(|d| ResolvedDate::new(d, DatePrecision::Month, CONFIDENCE_EXTERNAL_ANCHOR))
            }
            TemporalExpr::FromNarrative { years, month } => {
                let (base, confidence) = self.narrative_base(index)?;
                let year = base.year() + years;
                match month {
                    Some(m) => NaiveDate::from_ymd_opt(year, m, 1)
                        .map(|d| ResolvedDate::new(d, DatePrecision::Month, confidence)),
                    None => year_start(year).map(|d| ResolvedDate::new(d, DatePrecision::Year, confidence)),
                }
            }
            TemporalExpr::NextSeason(month) => {
                let (base, confidence) = self.narrative_base(index)?;
                let year = if month > base.month() { base.year() } else { base.year() + 1 };
                NaiveDate::from_ymd_opt(year, month, 1)
                    .map(|d| ResolvedDate::new(d, DatePrecision::Month, confidence))
            }
        }
    }
}

fn year_start(year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 1, 1)
}

/// Resolve every event locally. `None` means no reference, or one that no
/// available anchor can pin down.
pub fn resolve_heuristically(
    events: &[RawEvent],
    text: &str,
    anchor: Option<&TemporalAnchor>,
) -> Vec<Option<ResolvedDate>> {
    let exprs: Vec<Option<TemporalExpr>> = events
        .iter()
        .map(|e| e.raw_temporal_reference.as_deref().and_then(parse_reference))
        .collect();
    let anchors = Anchors::collect(&exprs, text, anchor);

    exprs
        .iter()
        .enumerate()
        .map(|(i, expr)| expr.and_then(|expr| anchors.resolve(i, expr)))
        .collect()
}

#[derive(Debug, Deserialize)]
struct DateAnswer {
    index: usize,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    precision: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Pins each event to a calendar date.
pub struct DateResolver {
    backend: AgentBackend,
}

impl DateResolver {
    pub fn new(backend: AgentBackend) -> Self {
        Self { backend }
    }

    fn accept(answer: &DateAnswer, event: &RawEvent) -> Option<ResolvedDate> {
        let (date, parsed_precision) = parse_loose_date(answer.date.as_deref()?)?;
        let stated = answer
            .precision
            .as_deref()
            .and_then(DatePrecision::parse)
            .unwrap_or(parsed_precision);
        let cap = reference_precision(event.raw_temporal_reference.as_deref());
        let precision = stated.min(parsed_precision).min(cap);
        if precision == DatePrecision::Unknown {
            return None;
        }
        let confidence = answer.confidence.unwrap_or(match precision {
            DatePrecision::Day => CONFIDENCE_DAY,
            DatePrecision::Month => CONFIDENCE_MONTH,
            _ => CONFIDENCE_YEAR,
        });
        Some(ResolvedDate::new(date, precision, confidence))
    }
}

#[async_trait]
impl Annotator for DateResolver {
    type Output = ResolvedDate;

    fn role(&self) -> AgentRole {
        AgentRole::DateResolver
    }

    fn backend(&self) -> &AgentBackend {
        &self.backend
    }

    fn heuristic(&self, events: &[RawEvent], ctx: &StageContext<'_>) -> Annotations<ResolvedDate> {
        Annotations::new(resolve_heuristically(events, ctx.text, ctx.anchor))
    }

    async fn ask_model(
        &self,
        caller: &ModelCaller,
        events: &[RawEvent],
        ctx: &StageContext<'_>,
    ) -> Result<Annotations<ResolvedDate>, GenerationError> {
        let anchor = ctx
            .anchor
            .and_then(|a| serde_json::to_string(a).ok())
            .unwrap_or_else(|| "none".to_string());
        let user = format!(
            "## Narrative\n{}\n\n## Known anchors\n{}\n\n## Events\n{}",
            ctx.text,
            anchor,
            events_for_prompt(events)
        );
        let prompt = ctx.prompt(self.role(), SYSTEM_PROMPT, user);

        let answers: Vec<DateAnswer> = caller.call_json(&prompt, ctx.cancel).await?;
        let mut annotations = Annotations::empty(events.len());
        for answer in &answers {
            let Some(event) = events.get(answer.index) else {
                debug!(index = answer.index, "Date answer for unknown event ignored");
                continue;
            };
            if let Some(date) = Self::accept(answer, event) {
                annotations.fill(answer.index, date);
            }
        }
        Ok(annotations)
    }
}
