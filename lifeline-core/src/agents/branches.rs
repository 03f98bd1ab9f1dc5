//! Branch classification: which events are major life changes.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::{events_for_prompt, AgentBackend, AgentRole, Annotations, Annotator, StageContext};
use crate::error::GenerationError;
use crate::generator::ModelCaller;
use crate::model::{BranchSignal, RawEvent};

const SYSTEM_PROMPT: &str = include_str!("prompts/branch_classifier.txt");

/// Theme rules, checked in order. The first hit names the branch.
static THEMES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    let theme = |name: &'static str, pattern: &str| {
        let regex = Regex::new(&format!("(?i){pattern}")).expect("valid theme regex");
        (name, regex)
    };
    vec![
        theme(
            "career",
            r"\b(?:quit|resigned from|left) (?:my|a|the) (?:job|position|career)\b|\b(?:start|started|starting|launch|launched|found|founded|co-founded) (?:a|my own|my|our|an) (?:own )?(?:company|business|startup|firm)\b|\bfounded\b|\bnew job\b|\b(?:got|was|were) (?:hired|promoted|laid off|fired)\b|\blaid off\b|\bretired\b|\bchanged careers\b|\bcareer change\b",
        ),
        theme(
            "relocation",
            r"\b(?:moved|relocated|emigrated|immigrated) (?:to|abroad|across|back to|overseas)\b|\bmoved (?:countries|cities)\b",
        ),
        theme(
            "relationship",
            r"\bgot (?:married|engaged|divorced)\b|\b(?:married|divorced)\b|\bbroke up\b|\bsplit up\b|\bproposed\b",
        ),
        theme(
            "family",
            r"\b(?:had|welcomed) (?:a|our|my) (?:first |second |third )?(?:baby|son|daughter|child)\b|\bbecame a (?:father|mother|parent|dad|mom|mum)\b|\bgave birth\b|\b(?:son|daughter|baby|child) was born\b",
        ),
        theme(
            "education",
            r"\bgraduated\b|\benrolled (?:in|at)\b|\b(?:start|started|began) (?:university|college|grad school|a phd|my phd|law school|medical school|a master'?s)\b|\bdropped out\b|\bwent (?:back )?to (?:university|college|grad school)\b",
        ),
        theme(
            "health",
            r"\bdiagnosed with\b|\b(?:had|underwent) (?:surgery|an operation|a transplant)\b|\bgot sober\b",
        ),
    ]
});

/// Classify one span by keyword themes.
pub fn classify_heuristically(span: &str) -> BranchSignal {
    THEMES
        .iter()
        .find(|(_, regex)| regex.is_match(span))
        .map(|(name, _)| BranchSignal::major(*name))
        .unwrap_or_else(BranchSignal::main_line)
}

#[derive(Debug, Deserialize)]
struct BranchAnswer {
    index: usize,
    #[serde(alias = "major", alias = "is_major")]
    is_major_change: bool,
    #[serde(default, alias = "suggested_branch_name", alias = "branch_name")]
    branch: Option<String>,
}

/// Decides which events open or continue a branch.
pub struct BranchClassifier {
    backend: AgentBackend,
}

impl BranchClassifier {
    pub fn new(backend: AgentBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Annotator for BranchClassifier {
    type Output = BranchSignal;

    fn role(&self) -> AgentRole {
        AgentRole::BranchClassifier
    }

    fn backend(&self) -> &AgentBackend {
        &self.backend
    }

    fn heuristic(&self, events: &[RawEvent], _ctx: &StageContext<'_>) -> Annotations<BranchSignal> {
        Annotations::new(
            events
                .iter()
                .map(|e| Some(classify_heuristically(&e.source_span)))
                .collect(),
        )
    }

    async fn ask_model(
        &self,
        caller: &ModelCaller,
        events: &[RawEvent],
        ctx: &StageContext<'_>,
    ) -> Result<Annotations<BranchSignal>, GenerationError> {
        let prompt = ctx.prompt(
            self.role(),
            SYSTEM_PROMPT,
            format!(
                "## Narrative\n{}\n\n## Events\n{}",
                ctx.text,
                events_for_prompt(events)
            ),
        );
        let answers: Vec<BranchAnswer> = caller.call_json(&prompt, ctx.cancel).await?;

        let mut annotations = Annotations::empty(events.len());
        for answer in answers {
            let signal = BranchSignal {
                is_major_change: answer.is_major_change,
                suggested_branch_name: answer
                    .branch
                    .filter(|b| answer.is_major_change && !b.trim().is_empty()),
            };
            annotations.fill(answer.index, signal);
        }
        Ok(annotations)
    }
}
