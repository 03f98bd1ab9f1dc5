//! The finished timeline: an arena of commits plus the branch index over it.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{iso_date, BranchName, DatePrecision};

/// Namespace for deterministic commit ids.
const COMMIT_NAMESPACE: Uuid = Uuid::from_u128(0x6c69_6665_6c69_4e65_8000_7469_6d65_6c6e);

/// Identifier of a commit. Derived from the commit's content and its parent,
/// so the same input always yields the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(Uuid);

impl CommitId {
    pub(crate) fn derive(
        parent: Option<CommitId>,
        branch: &BranchName,
        date: NaiveDate,
        message: &str,
        ordinal: usize,
    ) -> Self {
        let parent = parent.map(|p| p.0.to_string()).unwrap_or_default();
        let name = format!("{parent}|{branch}|{date}|{message}|{ordinal}");
        Self(Uuid::new_v5(&COMMIT_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a commit stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitKind {
    /// The synthetic first commit of every timeline.
    Root,
    /// One life event.
    Event,
    /// A branch folded back into main.
    Merge,
}

/// One node of the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub kind: CommitKind,
    #[serde(with = "iso_date")]
    pub date: NaiveDate,
    pub precision: DatePrecision,
    pub confidence: f32,
    pub message: String,
    pub description: String,
    pub branch: BranchName,
    pub parent_commit_id: Option<CommitId>,
    /// Second parent of a merge commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_parent_id: Option<CommitId>,
    pub is_major_change: bool,
    #[serde(default)]
    pub source_files: Vec<String>,
    #[serde(default)]
    pub provenance: Vec<String>,
    /// Mention order of the event this commit was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention_order: Option<usize>,
}

/// A named line of commits off the main line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: BranchName,
    /// The main-line commit the branch starts from.
    pub root: CommitId,
    /// Branch commits in placement order.
    pub commits: Vec<CommitId>,
    /// The merge commit on main, when branches are merged back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<CommitId>,
}

/// The externally visible shape of one event commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitDescriptor {
    pub message: String,
    #[serde(with = "iso_date")]
    pub date: NaiveDate,
    pub description: String,
    pub is_major_change: bool,
    pub branch: BranchName,
    pub source_files: Vec<String>,
}

/// A validated, immutable timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedTimeline {
    /// Every commit, in placement order. The root is first.
    commits: Vec<Commit>,
    /// Main-line commits in order, root first.
    main: Vec<CommitId>,
    /// Branches in order of creation.
    branches: Vec<Branch>,
}

impl ValidatedTimeline {
    pub(crate) fn new(commits: Vec<Commit>, main: Vec<CommitId>, branches: Vec<Branch>) -> Self {
        Self {
            commits,
            main,
            branches,
        }
    }

    /// All commits in placement order.
    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn root(&self) -> Option<&Commit> {
        self.commits.first()
    }

    pub fn commit(&self, id: CommitId) -> Option<&Commit> {
        self.commits.iter().find(|c| c.id == id)
    }

    /// Main-line commits in order, root first.
    pub fn main_line(&self) -> Vec<&Commit> {
        self.main.iter().filter_map(|id| self.commit(*id)).collect()
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.name.as_str() == name)
    }

    /// Commits on the named branch, in order. Empty for unknown names;
    /// `"main"` gives the main line.
    pub fn branch_commits(&self, name: &str) -> Vec<&Commit> {
        if name == BranchName::MAIN {
            return self.main_line();
        }
        self.branch(name)
            .map(|b| b.commits.iter().filter_map(|id| self.commit(*id)).collect())
            .unwrap_or_default()
    }

    /// Event commits only.
    pub fn events(&self) -> impl Iterator<Item = &Commit> {
        self.commits.iter().filter(|c| c.kind == CommitKind::Event)
    }

    /// One descriptor per event, in placement order.
    pub fn commit_descriptors(&self) -> Vec<CommitDescriptor> {
        self.events()
            .map(|c| CommitDescriptor {
                message: c.message.clone(),
                date: c.date,
                description: c.description.clone(),
                is_major_change: c.is_major_change,
                branch: c.branch.clone(),
                source_files: c.source_files.clone(),
            })
            .collect()
    }
}
