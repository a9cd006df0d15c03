//! Core data model of the memory graph.
//!
//! [`MemoryFragment`] is the unit of knowledge. It is created from a
//! [`NewFragment`] submission, scored, and then only moves forward through
//! quality snapshots, supersession, deprecation or archival. [`Conflict`]
//! records a detected contradiction between two fragments of one agent type.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{MemoryError, Result};
use super::fingerprint::ContextFingerprint;

/// UUID v7 string; time-sortable.
pub type FragmentId = String;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as text.
macro_rules! text_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!(concat!("unknown ", $what, ": {}"), s)),
                }
            }
        }
    };
}

/// What sort of knowledge a fragment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    /// How to do something.
    Procedural,
    /// A fact about the world or a codebase.
    Declarative,
    /// Knowledge about how to apply other knowledge.
    Meta,
    /// Something that looked right and was not.
    AntiPattern,
}

text_enum!(KnowledgeKind, "knowledge kind", {
    Procedural => "procedural",
    Declarative => "declarative",
    Meta => "meta",
    AntiPattern => "anti_pattern",
});

/// Structured fragment body. Written once, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentContent {
    pub pattern: String,
    #[serde(default)]
    pub situation: String,
    #[serde(default)]
    pub approach: String,
    pub reasoning: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub not_applicable_when: Vec<String>,
}

impl FragmentContent {
    pub fn new(pattern: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reasoning: reasoning.into(),
            ..Default::default()
        }
    }

    pub fn with_situation(mut self, situation: impl Into<String>) -> Self {
        self.situation = situation.into();
        self
    }

    pub fn with_approach(mut self, approach: impl Into<String>) -> Self {
        self.approach = approach.into();
        self
    }

    pub fn with_alternatives<I, S>(mut self, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alternatives = alternatives.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_not_applicable_when<I, S>(mut self, conditions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.not_applicable_when = conditions.into_iter().map(Into::into).collect();
        self
    }

    /// Text handed to the embedding provider: situation, pattern, approach.
    pub fn embedding_text(&self) -> String {
        [&self.situation, &self.pattern, &self.approach]
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// SHA-256 over the canonical JSON body, checked on every read.
    pub fn digest(&self) -> Result<String> {
        let body = serde_json::to_string(self)?;
        Ok(format!("{:x}", Sha256::digest(body.as_bytes())))
    }
}

/// The six quality sub-scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub confidence: f64,
    pub validation: f64,
    pub recency: f64,
    pub consensus: f64,
    pub context_specificity: f64,
    pub impact: f64,
}

impl QualityScores {
    pub fn is_finite(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite())
    }

    pub fn as_array(&self) -> [f64; 6] {
        [
            self.confidence,
            self.validation,
            self.recency,
            self.consensus,
            self.context_specificity,
            self.impact,
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Feedback events received.
    pub validation_count: u32,
    pub application_count: u32,
    /// Running mean of feedback success in `[0, 1]`.
    pub success_rate: f64,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalMetadata {
    pub created_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub deprecated_at: Option<DateTime<Utc>>,
}

/// Where a fragment applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Applies wherever the context fingerprint matches.
    #[default]
    Contextual,
    /// Applies everywhere; structural filtering skips fingerprint comparison.
    Universal,
    /// Bound to one project; the caller's project and the fingerprint must both match.
    Project(String),
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contextual => "contextual",
            Self::Universal => "universal",
            Self::Project(_) => "project",
        }
    }

    pub fn project_id(&self) -> Option<&str> {
        match self {
            Self::Project(id) => Some(id),
            _ => None,
        }
    }

    /// Rebuild from the `scope` and `project_id` columns.
    pub fn from_parts(scope: &str, project_id: Option<String>) -> std::result::Result<Self, String> {
        match (scope, project_id) {
            ("contextual", _) => Ok(Self::Contextual),
            ("universal", _) => Ok(Self::Universal),
            ("project", Some(id)) => Ok(Self::Project(id)),
            ("project", None) => Err("project scope without project id".into()),
            (other, _) => Err(format!("unknown scope: {other}")),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Project(id) => write!(f, "project:{id}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A conflict as seen from one of its two fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictLink {
    pub conflict_id: String,
    pub other: FragmentId,
    pub conflict_type: ConflictType,
    pub status: ConflictStatus,
}

/// A stored unit of agent knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFragment {
    pub id: FragmentId,
    pub agent_type: String,
    pub kind: KnowledgeKind,
    pub content: FragmentContent,
    /// Composite quality in `[0, ceiling]`.
    pub quality_score: f64,
    pub quality: QualityScores,
    pub fingerprint: ContextFingerprint,
    pub usage: UsageStats,
    /// Agent instance ids, sorted.
    pub contributors: Vec<String>,
    pub temporal: TemporalMetadata,
    pub supersedes: Vec<FragmentId>,
    pub superseded_by: Option<FragmentId>,
    /// Fragment the submitter declared this one replaces.
    pub replaces: Option<FragmentId>,
    pub conflicts: Vec<ConflictLink>,
    pub scope: Scope,
    /// Read-only references to fragments owned by other agent types.
    pub cross_type_refs: Vec<FragmentId>,
    pub archived_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter; bumped by every quality or temporal write.
    pub version: i64,
}

impl MemoryFragment {
    /// Assemble a version-1 fragment from a validated submission.
    pub fn from_submission(
        id: FragmentId,
        new: &NewFragment,
        quality: QualityScores,
        quality_score: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            agent_type: new.agent_type.trim().to_string(),
            kind: new.kind,
            content: new.content.clone(),
            quality_score,
            quality,
            fingerprint: new.fingerprint.clone(),
            usage: UsageStats::default(),
            contributors: new.all_contributors(),
            temporal: TemporalMetadata {
                created_at: now,
                last_validated_at: now,
                valid_from: new.valid_from.unwrap_or(now),
                valid_until: new.valid_until,
                deprecated_at: None,
            },
            supersedes: Vec::new(),
            superseded_by: None,
            replaces: new.replaces.clone(),
            conflicts: Vec::new(),
            scope: new.scope.clone(),
            cross_type_refs: new.cross_type_refs.clone(),
            archived_at: None,
            version: 1,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }
}

/// A fragment submission, validated before anything is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFragment {
    pub agent_type: String,
    /// Submitting agent instance; becomes the first contributor.
    pub instance_id: String,
    pub kind: KnowledgeKind,
    pub content: FragmentContent,
    #[serde(default)]
    pub fingerprint: ContextFingerprint,
    #[serde(default)]
    pub scope: Scope,
    /// Submitter confidence in `[0, 1]`; the configured default when absent.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Seeds the composite score instead of deriving it from sub-scores.
    #[serde(default)]
    pub initial_quality: Option<f64>,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub replaces: Option<FragmentId>,
    #[serde(default)]
    pub cross_type_refs: Vec<FragmentId>,
    /// Co-contributors beyond the submitter.
    #[serde(default)]
    pub contributors: Vec<String>,
}

impl NewFragment {
    pub fn new(
        agent_type: impl Into<String>,
        instance_id: impl Into<String>,
        kind: KnowledgeKind,
        content: FragmentContent,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            instance_id: instance_id.into(),
            kind,
            content,
            fingerprint: ContextFingerprint::default(),
            scope: Scope::Contextual,
            confidence: None,
            initial_quality: None,
            valid_from: None,
            valid_until: None,
            replaces: None,
            cross_type_refs: Vec::new(),
            contributors: Vec::new(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: ContextFingerprint) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_initial_quality(mut self, quality: f64) -> Self {
        self.initial_quality = Some(quality);
        self
    }

    pub fn with_validity(
        mut self,
        valid_from: Option<DateTime<Utc>>,
        valid_until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = valid_from;
        self.valid_until = valid_until;
        self
    }

    pub fn replacing(mut self, id: impl Into<FragmentId>) -> Self {
        self.replaces = Some(id.into());
        self
    }

    /// Submitter plus co-contributors, sorted and deduplicated.
    pub fn all_contributors(&self) -> Vec<String> {
        let mut all: Vec<String> = std::iter::once(&self.instance_id)
            .chain(self.contributors.iter())
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Reject malformed submissions before any write.
    pub fn validate(&self) -> Result<()> {
        let missing = |field: &str| Err(MemoryError::Validation(format!("{field} is required")));

        if self.agent_type.trim().is_empty() {
            return missing("agent_type");
        }
        if self.instance_id.trim().is_empty() {
            return missing("instance_id");
        }
        if self.content.pattern.trim().is_empty() {
            return missing("content.pattern");
        }
        if self.content.reasoning.trim().is_empty() {
            return missing("content.reasoning");
        }

        for (name, value) in [
            ("confidence", self.confidence),
            ("initial_quality", self.initial_quality),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                    return Err(MemoryError::Validation(format!(
                        "{name} must be between 0.0 and 1.0, got {v}"
                    )));
                }
            }
        }

        if let (Some(from), Some(until)) = (self.valid_from, self.valid_until) {
            if until <= from {
                return Err(MemoryError::Validation(
                    "valid_until must be after valid_from".into(),
                ));
            }
        }

        if let Scope::Project(id) = &self.scope {
            if id.trim().is_empty() {
                return missing("project id for project scope");
            }
        }

        if matches!(&self.replaces, Some(id) if id.trim().is_empty()) {
            return Err(MemoryError::Validation("replaces must not be empty".into()));
        }

        Ok(())
    }
}

/// Feedback reported by an agent instance after applying a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Helpful,
    PartiallyHelpful,
    NotHelpful,
    Harmful,
}

text_enum!(FeedbackOutcome, "feedback outcome", {
    Helpful => "helpful",
    PartiallyHelpful => "partially_helpful",
    NotHelpful => "not_helpful",
    Harmful => "harmful",
});

impl FeedbackOutcome {
    /// Target value blended into the composite score.
    pub fn value(&self) -> f64 {
        match self {
            Self::Helpful => 1.0,
            Self::PartiallyHelpful => 0.5,
            Self::NotHelpful => 0.0,
            Self::Harmful => -0.5,
        }
    }

    /// Contribution to the running success rate.
    pub fn success(&self) -> f64 {
        match self {
            Self::Helpful => 1.0,
            Self::PartiallyHelpful => 0.5,
            Self::NotHelpful | Self::Harmful => 0.0,
        }
    }

    /// Signal credited to the fragment's contributors.
    pub fn reputation_signal(&self) -> f64 {
        match self {
            Self::Helpful => 1.0,
            Self::PartiallyHelpful => 0.5,
            Self::NotHelpful => -0.5,
            Self::Harmful => -1.0,
        }
    }

    /// Positive feedback counts as re-validation.
    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Helpful | Self::PartiallyHelpful)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The newer fragment replaces the older one.
    Temporal,
    /// Both are right in their own contexts.
    Contextual,
    /// Same context, opposing recommendations.
    Direct,
}

text_enum!(ConflictType, "conflict type", {
    Temporal => "temporal",
    Contextual => "contextual",
    Direct => "direct",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Detected,
    Classified,
    AutoResolved,
    DebateRequested,
    /// The debate oracle returned a winner or a consensus fragment.
    Resolved,
    /// No automatic outcome; both fragments stay retrievable with a warning.
    Escalated,
}

text_enum!(ConflictStatus, "conflict status", {
    Detected => "detected",
    Classified => "classified",
    AutoResolved => "auto_resolved",
    DebateRequested => "debate_requested",
    Resolved => "resolved",
    Escalated => "escalated",
});

impl ConflictStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AutoResolved | Self::Resolved | Self::Escalated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// Newer fragment superseded the older one.
    Supersession,
    /// Higher-quality fragment won by more than the configured gap.
    QualityGap,
    /// Contextual conflict; structural filtering keeps them apart.
    ScopeSeparation,
    OracleWinner,
    OracleConsensus,
    Escalation,
    /// One side was superseded before this conflict came up for resolution.
    Obsolete,
}

text_enum!(ResolutionMethod, "resolution method", {
    Supersession => "supersession",
    QualityGap => "quality_gap",
    ScopeSeparation => "scope_separation",
    OracleWinner => "oracle_winner",
    OracleConsensus => "oracle_consensus",
    Escalation => "escalation",
    Obsolete => "obsolete",
});

/// Which fragments survive a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConflictOutcome {
    Winner {
        survivor: FragmentId,
        superseded: FragmentId,
    },
    Consensus {
        fragment: FragmentId,
        superseded: Vec<FragmentId>,
    },
    BothRetained,
}

impl ConflictOutcome {
    /// Fragment that should be checked for further conflicts.
    pub fn survivor(&self) -> Option<&str> {
        match self {
            Self::Winner { survivor, .. } => Some(survivor),
            Self::Consensus { fragment, .. } => Some(fragment),
            Self::BothRetained => None,
        }
    }
}

/// A detected contradiction between two fragments of the same agent type.
///
/// `fragment_a < fragment_b` always holds, so one pair maps to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub agent_type: String,
    pub fragment_a: FragmentId,
    pub fragment_b: FragmentId,
    pub conflict_type: ConflictType,
    pub status: ConflictStatus,
    pub resolution_method: Option<ResolutionMethod>,
    pub outcome: Option<ConflictOutcome>,
    pub rationale: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    pub fn other(&self, id: &str) -> &str {
        if self.fragment_a == id {
            &self.fragment_b
        } else {
            &self.fragment_a
        }
    }
}

/// Typed graph edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    /// agent type -> fragment
    Owns,
    /// fragment -> agent instance
    ContributedBy,
    /// fragment -> context fingerprint
    AppliesIn,
    /// newer fragment -> older fragment
    Supersedes,
    /// fragment -> fragment
    ConflictsWith,
    /// fragment -> agent instance
    ValidatedBy,
    /// fragment -> project
    ScopedTo,
}

text_enum!(EdgeType, "edge type", {
    Owns => "OWNS",
    ContributedBy => "CONTRIBUTED_BY",
    AppliesIn => "APPLIES_IN",
    Supersedes => "SUPERSEDES",
    ConflictsWith => "CONFLICTS_WITH",
    ValidatedBy => "VALIDATED_BY",
    ScopedTo => "SCOPED_TO",
});

/// Current time at the precision timestamps are persisted with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 (microseconds, `Z`); sorts lexicographically.
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
