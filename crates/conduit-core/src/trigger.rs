//! Trigger context and typed branch/tag filters.

use crate::{Error, Result};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Branch,
    Tag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[default]
    Push,
    PullRequest,
    Scheduled,
    Api,
    Manual,
}

/// Why a run was initiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerContext {
    pub git_ref: String,
    pub ref_kind: RefKind,
    #[serde(default)]
    pub event: EventKind,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Branch => "branch",
            RefKind::Tag => "tag",
        }
    }
}

impl TriggerContext {
    pub fn branch(name: impl Into<String>) -> Self {
        Self {
            git_ref: name.into(),
            ref_kind: RefKind::Branch,
            event: EventKind::Push,
        }
    }

    pub fn tag(name: impl Into<String>) -> Self {
        Self {
            git_ref: name.into(),
            ref_kind: RefKind::Tag,
            event: EventKind::Push,
        }
    }

    pub fn with_event(mut self, event: EventKind) -> Self {
        self.event = event;
        self
    }
}

impl fmt::Display for TriggerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ref_kind.as_str(), self.git_ref)
    }
}

/// One or many patterns; `only: main` and `only: [main]` are equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "OneOrMany", into = "Vec<String>")]
pub struct PatternList(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for PatternList {
    fn from(v: OneOrMany) -> Self {
        match v {
            OneOrMany::One(s) => PatternList(vec![s]),
            OneOrMany::Many(v) => PatternList(v),
        }
    }
}

impl From<PatternList> for Vec<String> {
    fn from(p: PatternList) -> Self {
        p.0
    }
}

impl PatternList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Authored allow/deny lists for one ref kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatternSpec {
    #[serde(default)]
    pub only: PatternList,
    #[serde(default)]
    pub ignore: PatternList,
}

/// Authored `filters:` block of a workflow job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub branches: Option<PatternSpec>,
    #[serde(default)]
    pub tags: Option<PatternSpec>,
}

impl FilterSpec {
    pub fn branches_only(patterns: &[&str]) -> Self {
        Self {
            branches: Some(PatternSpec {
                only: PatternList(patterns.iter().map(|p| p.to_string()).collect()),
                ignore: PatternList::default(),
            }),
            tags: None,
        }
    }

    pub fn tags_only(patterns: &[&str]) -> Self {
        Self {
            branches: None,
            tags: Some(PatternSpec {
                only: PatternList(patterns.iter().map(|p| p.to_string()).collect()),
                ignore: PatternList::default(),
            }),
        }
    }

    pub fn ignore_branches(mut self, patterns: &[&str]) -> Self {
        let branches = self.branches.get_or_insert_with(PatternSpec::default);
        branches.ignore = PatternList(patterns.iter().map(|p| p.to_string()).collect());
        self
    }
}

/// A compiled, anchored ref pattern.
///
/// `/.../` is a regular expression; anything else is a glob where `*` stays
/// within a path segment, `**` crosses segments and `?` is one character.
#[derive(Debug, Clone)]
pub struct RefPattern {
    source: String,
    regex: Regex,
}

impl RefPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let body = match pattern
            .strip_prefix('/')
            .and_then(|p| p.strip_suffix('/'))
        {
            Some(re) if !re.is_empty() => re.to_string(),
            _ => glob_to_regex(pattern),
        };
        let regex = Regex::new(&format!("^(?:{})$", body)).map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, git_ref: &str) -> bool {
        self.regex.is_match(git_ref)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out
}

/// Compiled allow/deny sets.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    pub only: Vec<RefPattern>,
    pub ignore: Vec<RefPattern>,
}

impl PatternSet {
    pub fn compile(spec: &PatternSpec) -> Result<Self> {
        Ok(Self {
            only: spec.only.0.iter().map(|p| RefPattern::parse(p)).collect::<Result<_>>()?,
            ignore: spec
                .ignore
                .0
                .iter()
                .map(|p| RefPattern::parse(p))
                .collect::<Result<_>>()?,
        })
    }

    pub fn allows(&self, git_ref: &str) -> bool {
        self.only.iter().any(|p| p.matches(git_ref))
    }

    pub fn denies(&self, git_ref: &str) -> bool {
        self.ignore.iter().any(|p| p.matches(git_ref))
    }

    /// `only` (when present) must match and `ignore` must not.
    pub fn passes(&self, git_ref: &str) -> bool {
        (self.only.is_empty() || self.allows(git_ref)) && !self.denies(git_ref)
    }
}

/// The typed filter carried by a job instance.
#[derive(Debug, Clone, Default)]
pub struct RefFilter {
    pub branches: Option<PatternSet>,
    pub tags: Option<PatternSet>,
}

impl RefFilter {
    pub fn compile(spec: &FilterSpec) -> Result<Self> {
        Ok(Self {
            branches: spec.branches.as_ref().map(PatternSet::compile).transpose()?,
            tags: spec.tags.as_ref().map(PatternSet::compile).transpose()?,
        })
    }

    pub fn is_unrestricted(&self) -> bool {
        self.branches.is_none() && self.tags.is_none()
    }

    /// Whether tags are explicitly allowed.
    pub fn allows_tags(&self) -> bool {
        self.tags.as_ref().is_some_and(|t| !t.only.is_empty())
    }
}

/// Makes the branch/tag asymmetry explicit.
///
/// Defaults: tags are opt-in, branches are opt-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FilterPolicy {
    /// On a tag ref, a job runs only if its `tags.only` matches.
    #[serde(default = "default_true")]
    pub tags_require_opt_in: bool,
    /// On a branch ref, a job restricted by `tags.only` (and without a branch
    /// filter) is excluded.
    #[serde(default = "default_true")]
    pub tag_filters_exclude_branches: bool,
    /// A job without any filter runs on tag refs too.
    #[serde(default = "default_true")]
    pub unfiltered_jobs_run_on_tags: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            tags_require_opt_in: true,
            tag_filters_exclude_branches: true,
            unfiltered_jobs_run_on_tags: true,
        }
    }
}

impl FilterPolicy {
    /// Same treatment for both ref kinds: a filter on one kind never affects the other.
    pub fn symmetric() -> Self {
        Self {
            tags_require_opt_in: false,
            tag_filters_exclude_branches: false,
            unfiltered_jobs_run_on_tags: true,
        }
    }
}
