//! Commit message generation.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::{events_for_prompt, AgentBackend, AgentRole, Annotations, Annotator, StageContext};
use crate::error::GenerationError;
use crate::generator::ModelCaller;
use crate::model::{CommitLabel, RawEvent};

const SYSTEM_PROMPT: &str = include_str!("prompts/commit_messages.txt");

static LEADING_ADVERBIAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:(?:before|after) that|then|later(?: on)?|afterwards|eventually|finally|meanwhile|soon after|in the end|at first|also|and|but|so)\s*,?\s+",
    )
    .expect("valid adverbial regex")
});

static SUBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:I|We|we)\s+(?:(?:also|finally|then|eventually|actually|officially)\s+)?")
        .expect("valid subject regex")
});

/// Build a label from the span alone. `None` when nothing is left once the
/// time expression and the subject are stripped.
pub fn label_heuristically(event: &RawEvent, max_len: usize) -> Option<CommitLabel> {
    let mut text = collapse_whitespace(&event.source_span);

    if let Some(reference) = event.raw_temporal_reference.as_deref() {
        text = strip_reference(&text, reference);
    }
    loop {
        let stripped = LEADING_ADVERBIAL.replace(text.trim(), "").to_string();
        if stripped == text.trim() {
            break;
        }
        text = stripped;
    }
    let text = SUBJECT.replace(text.trim(), "");
    let text = text.trim().trim_end_matches(['.', '!', '?', ';', ',', ':']).trim();
    if text.is_empty() {
        return None;
    }

    let message = imperative(text);
    Some(CommitLabel {
        short_message: truncate_message(&message, max_len),
        long_description: event.source_span.trim().to_string(),
        provenance: vec![event.source_span.clone()],
    })
}

/// The last-resort label: the span itself, bounded.
pub fn fallback_label(event: &RawEvent, max_len: usize) -> CommitLabel {
    let subject = collapse_whitespace(&event.source_span);
    let subject = subject.trim_end_matches(['.', '!', '?', ';', ',', ':']);
    CommitLabel {
        short_message: truncate_message(subject, max_len),
        long_description: event.source_span.trim().to_string(),
        provenance: vec![event.source_span.clone()],
    }
}

const ELLIPSIS: &str = "...";

/// Bound `message` to `max_len` characters, ending in "..." when cut.
pub fn truncate_message(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        return message.to_string();
    }
    if max_len <= ELLIPSIS.len() {
        return message.chars().take(max_len).collect();
    }
    let kept: String = message.chars().take(max_len - ELLIPSIS.len()).collect();
    format!("{}{ELLIPSIS}", kept.trim_end())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove the time expression and the preposition that introduces it.
fn strip_reference(text: &str, reference: &str) -> String {
    let pattern = format!(
        r"(?i)(?:\b(?:back in|in|during|by|around|on|since|from|until)\s+)?{}\s*,?",
        regex::escape(reference)
    );
    match Regex::new(&pattern) {
        Ok(re) => collapse_whitespace(&re.replacen(text, 1, " ")),
        Err(_) => text.to_string(),
    }
}

/// Rewrite a leading past-tense verb into the imperative and capitalise.
fn imperative(text: &str) -> String {
    let (first, rest) = match text.split_once(' ') {
        Some((first, rest)) => (first, Some(rest)),
        None => (text, None),
    };
    let head = match present_tense(&first.to_lowercase()) {
        Some(verb) => capitalize(verb),
        None => capitalize(first),
    };
    match rest {
        Some(rest) => format!("{head} {rest}"),
        None => head,
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn present_tense(verb: &str) -> Option<&'static str> {
    let base = match verb {
        "adopted" => "adopt",
        "began" => "begin",
        "bought" => "buy",
        "broke" => "break",
        "built" => "build",
        "became" => "become",
        "changed" => "change",
        "closed" => "close",
        "decided" => "decide",
        "divorced" => "divorce",
        "dropped" => "drop",
        "enrolled" => "enroll",
        "fell" => "fall",
        "finished" => "finish",
        "found" => "find",
        "founded" => "found",
        "got" => "get",
        "graduated" => "graduate",
        "had" => "have",
        "joined" => "join",
        "landed" => "land",
        "launched" => "launch",
        "learned" | "learnt" => "learn",
        "left" => "leave",
        "lost" => "lose",
        "made" => "make",
        "married" => "marry",
        "met" => "meet",
        "moved" => "move",
        "opened" => "open",
        "published" => "publish",
        "quit" => "quit",
        "ran" => "run",
        "relocated" => "relocate",
        "retired" => "retire",
        "returned" => "return",
        "signed" => "sign",
        "sold" => "sell",
        "started" => "start",
        "switched" => "switch",
        "took" => "take",
        "traveled" | "travelled" => "travel",
        "visited" => "visit",
        "was" | "were" => "be",
        "went" => "go",
        "won" => "win",
        "wrote" => "write",
        _ => return None,
    };
    Some(base)
}

#[derive(Debug, Deserialize)]
struct LabelAnswer {
    index: usize,
    #[serde(alias = "commit_message", alias = "short_message")]
    message: String,
    #[serde(default, alias = "long_description")]
    description: Option<String>,
}

/// Writes a short commit subject and a body for each event.
pub struct CommitMessageGenerator {
    backend: AgentBackend,
}

impl CommitMessageGenerator {
    pub fn new(backend: AgentBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Annotator for CommitMessageGenerator {
    type Output = CommitLabel;

    fn role(&self) -> AgentRole {
        AgentRole::CommitMessageGenerator
    }

    fn backend(&self) -> &AgentBackend {
        &self.backend
    }

    fn heuristic(&self, events: &[RawEvent], ctx: &StageContext<'_>) -> Annotations<CommitLabel> {
        let max_len = ctx.config.max_message_len;
        Annotations::new(events.iter().map(|e| label_heuristically(e, max_len)).collect())
    }

    async fn ask_model(
        &self,
        caller: &ModelCaller,
        events: &[RawEvent],
        ctx: &StageContext<'_>,
    ) -> Result<Annotations<CommitLabel>, GenerationError> {
        let prompt = ctx.prompt(
            self.role(),
            SYSTEM_PROMPT,
            format!("## Events\n{}", events_for_prompt(events)),
        );
        let answers: Vec<LabelAnswer> = caller.call_json(&prompt, ctx.cancel).await?;

        let max_len = ctx.config.max_message_len;
        let mut annotations = Annotations::empty(events.len());
        for answer in answers {
            let Some(event) = events.get(answer.index) else {
                continue;
            };
            let message = collapse_whitespace(&answer.message);
            let message = message.trim_end_matches('.');
            if message.is_empty() {
                continue;
            }
            let description = answer
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| event.source_span.trim().to_string());
            annotations.fill(
                answer.index,
                CommitLabel {
                    short_message: truncate_message(message, max_len),
                    long_description: description,
                    provenance: vec![event.source_span.clone()],
                },
            );
        }
        Ok(annotations)
    }
}
