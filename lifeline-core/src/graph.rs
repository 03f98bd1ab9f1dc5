//! Graph construction: place validated events into a branching history.
//!
//! Events are walked in chronological order (ties by mention order). Minor
//! events advance main. A major event opens its branch from the current main
//! tip, or continues the branch if it already exists; main does not advance.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::error::{SynthesisError, SynthesisResult};
use crate::model::{BranchName, DatePrecision, ValidatedEvent};
use crate::timeline::{Branch, Commit, CommitId, CommitKind, ValidatedTimeline};

pub const ROOT_MESSAGE: &str = "Initialize life story";

/// Graph placement options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphOptions {
    /// Fold each branch back into main after its last event.
    pub merge_branches: bool,
}

/// Arena under construction. Commits are appended; branches point into it
/// by index.
struct Builder {
    commits: Vec<Commit>,
    main: Vec<CommitId>,
    branches: Vec<Branch>,
    /// Branch name -> (index into `branches`, index of its tip in `commits`).
    open: BTreeMap<BranchName, (usize, usize)>,
    main_tip: usize,
}

impl Builder {
    fn with_root(date: chrono::NaiveDate) -> Self {
        let main = BranchName::main();
        let id = CommitId::derive(None, &main, date, ROOT_MESSAGE, 0);
        let root = Commit {
            id,
            kind: CommitKind::Root,
            date,
            precision: DatePrecision::Unknown,
            confidence: 0.0,
            message: ROOT_MESSAGE.to_string(),
            description: String::new(),
            branch: main,
            parent_commit_id: None,
            merge_parent_id: None,
            is_major_change: false,
            source_files: Vec::new(),
            provenance: Vec::new(),
            mention_order: None,
        };
        Self {
            commits: vec![root],
            main: vec![id],
            branches: Vec::new(),
            open: BTreeMap::new(),
            main_tip: 0,
        }
    }

    fn id_at(&self, index: usize) -> SynthesisResult<CommitId> {
        self.commits
            .get(index)
            .map(|c| c.id)
            .ok_or_else(|| SynthesisError::invariant(format!("no commit at arena index {index}")))
    }

    fn push(&mut self, commit: Commit) -> usize {
        self.commits.push(commit);
        self.commits.len() - 1
    }

    fn event_commit(&self, event: &ValidatedEvent, branch: BranchName, parent: CommitId) -> Commit {
        let id = CommitId::derive(
            Some(parent),
            &branch,
            event.date.date,
            &event.label.short_message,
            event.raw.mention_order + 1,
        );
        Commit {
            id,
            kind: CommitKind::Event,
            date: event.date.date,
            precision: event.date.precision,
            confidence: event.date.confidence,
            message: event.label.short_message.clone(),
            description: event.label.long_description.clone(),
            branch,
            parent_commit_id: Some(parent),
            merge_parent_id: None,
            is_major_change: event.is_major_change,
            source_files: event.source_files.clone(),
            provenance: event.label.provenance.clone(),
            mention_order: Some(event.raw.mention_order),
        }
    }

    fn place_on_main(&mut self, event: &ValidatedEvent) -> SynthesisResult<()> {
        let parent = self.id_at(self.main_tip)?;
        let commit = self.event_commit(event, BranchName::main(), parent);
        self.main.push(commit.id);
        self.main_tip = self.push(commit);
        Ok(())
    }

    fn place_on_branch(&mut self, event: &ValidatedEvent, name: &BranchName) -> SynthesisResult<usize> {
        let (slot, parent) = match self.open.get(name) {
            Some(&(slot, tip)) => (slot, self.id_at(tip)?),
            None => {
                let root = self.id_at(self.main_tip)?;
                self.branches.push(Branch {
                    name: name.clone(),
                    root,
                    commits: Vec::new(),
                    merged_at: None,
                });
                debug!(branch = %name, "Opened branch");
                (self.branches.len() - 1, root)
            }
        };

        let commit = self.event_commit(event, name.clone(), parent);
        let id = commit.id;
        let tip = self.push(commit);
        self.open.insert(name.clone(), (slot, tip));
        self.branches
            .get_mut(slot)
            .ok_or_else(|| SynthesisError::invariant(format!("branch slot {slot} missing")))?
            .commits
            .push(id);
        Ok(slot)
    }

    fn merge(&mut self, name: &BranchName, date: chrono::NaiveDate) -> SynthesisResult<()> {
        let (slot, tip) = self
            .open
            .remove(name)
            .ok_or_else(|| SynthesisError::invariant(format!("merging unknown branch '{name}'")))?;
        let main_parent = self.id_at(self.main_tip)?;
        let branch_parent = self.id_at(tip)?;
        let main = BranchName::main();
        let message = format!("Merge branch '{name}'");
        let id = CommitId::derive(Some(main_parent), &main, date, &message, self.commits.len());

        self.main.push(id);
        self.main_tip = self.push(Commit {
            id,
            kind: CommitKind::Merge,
            date,
            precision: DatePrecision::Unknown,
            confidence: 0.0,
            message,
            description: String::new(),
            branch: main,
            parent_commit_id: Some(main_parent),
            merge_parent_id: Some(branch_parent),
            is_major_change: false,
            source_files: Vec::new(),
            provenance: Vec::new(),
            mention_order: None,
        });
        if let Some(branch) = self.branches.get_mut(slot) {
            branch.merged_at = Some(id);
        }
        Ok(())
    }

    fn finish(self) -> SynthesisResult<ValidatedTimeline> {
        let timeline = ValidatedTimeline::new(self.commits, self.main, self.branches);
        check_invariants(&timeline)?;
        Ok(timeline)
    }
}

/// Order events chronologically. On the same date, placeholder dates go
/// after known ones, then mention order decides.
pub fn chronological(mut events: Vec<ValidatedEvent>) -> Vec<ValidatedEvent> {
    events.sort_by(|a, b| {
        a.date
            .date
            .cmp(&b.date.date)
            .then(a.date.is_unknown().cmp(&b.date.is_unknown()))
            .then(a.raw.mention_order.cmp(&b.raw.mention_order))
    });
    events
}

/// Build the timeline graph from validated events.
pub fn build_timeline(events: Vec<ValidatedEvent>, options: GraphOptions) -> SynthesisResult<ValidatedTimeline> {
    let events = chronological(events);
    let first = events
        .first()
        .ok_or_else(|| SynthesisError::invariant("no events to place"))?;
    let mut builder = Builder::with_root(first.date.date);

    let mut remaining: HashMap<BranchName, usize> = HashMap::new();
    for event in &events {
        if let (true, Some(name)) = (event.is_major_change, &event.branch) {
            *remaining.entry(name.clone()).or_default() += 1;
        }
    }

    for event in &events {
        if !event.is_major_change {
            builder.place_on_main(event)?;
            continue;
        }
        let name = event.branch.as_ref().ok_or_else(|| {
            SynthesisError::invariant(format!(
                "major event {} has no branch name",
                event.raw.mention_order
            ))
        })?;
        if name.is_main() {
            return Err(SynthesisError::invariant("a major event cannot target main"));
        }
        builder.place_on_branch(event, name)?;

        let left = remaining.entry(name.clone()).or_default();
        *left = left.saturating_sub(1);
        if options.merge_branches && *left == 0 {
            builder.merge(name, event.date.date)?;
        }
    }

    builder.finish()
}

/// Structural checks on a finished timeline.
pub fn check_invariants(timeline: &ValidatedTimeline) -> SynthesisResult<()> {
    let root = timeline
        .root()
        .ok_or_else(|| SynthesisError::invariant("timeline has no root commit"))?;
    if root.kind != CommitKind::Root || root.parent_commit_id.is_some() {
        return Err(SynthesisError::invariant("first commit is not a parentless root"));
    }

    let main = timeline.main_line();
    for pair in main.windows(2) {
        if pair[1].date < pair[0].date {
            return Err(SynthesisError::invariant(format!(
                "main line goes back in time at '{}'",
                pair[1].message
            )));
        }
        if pair[1].parent_commit_id != Some(pair[0].id) {
            return Err(SynthesisError::invariant(format!(
                "main line is not a chain at '{}'",
                pair[1].message
            )));
        }
    }

    let mut seen = std::collections::HashSet::new();
    for branch in timeline.branches() {
        if branch.name.is_main() || !seen.insert(branch.name.as_str()) {
            return Err(SynthesisError::invariant(format!(
                "duplicate branch name '{}'",
                branch.name
            )));
        }
        let root = timeline
            .commit(branch.root)
            .ok_or_else(|| SynthesisError::invariant(format!("branch '{}' has no root", branch.name)))?;
        let first = branch
            .commits
            .first()
            .and_then(|id| timeline.commit(*id))
            .ok_or_else(|| SynthesisError::invariant(format!("branch '{}' is empty", branch.name)))?;
        if root.date > first.date {
            return Err(SynthesisError::invariant(format!(
                "branch '{}' starts before its root",
                branch.name
            )));
        }
    }
    Ok(())
}
