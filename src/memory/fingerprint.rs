//! Context fingerprints and their similarity.
//!
//! A [`ContextFingerprint`] describes the situation a fragment applies to. Two
//! fingerprints are compared field by field (weighted Jaccard for tag sets,
//! ordinal distance for the enums) into a score in `[0, 1]`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

const CATEGORY_WEIGHT: f64 = 0.30;
const TECHNOLOGY_WEIGHT: f64 = 0.30;
const CONSTRAINT_WEIGHT: f64 = 0.15;
const SCALE_WEIGHT: f64 = 0.15;
const TEAM_WEIGHT: f64 = 0.10;

/// Number of independently populated fields, used for context specificity.
pub const FIELD_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectScale {
    Prototype,
    Small,
    Medium,
    Large,
    Enterprise,
}

impl ProjectScale {
    fn rank(self) -> i32 {
        self as i32
    }
}

impl std::str::FromStr for ProjectScale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "prototype" => Ok(Self::Prototype),
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown project scale: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamSize {
    Solo,
    Small,
    Medium,
    Large,
}

impl TeamSize {
    fn rank(self) -> i32 {
        self as i32
    }
}

impl std::str::FromStr for TeamSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "solo" => Ok(Self::Solo),
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(format!("unknown team size: {other}")),
        }
    }
}

/// Immutable descriptor of a task situation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFingerprint {
    #[serde(default)]
    categories: BTreeSet<String>,
    #[serde(default)]
    scale: Option<ProjectScale>,
    #[serde(default)]
    technologies: BTreeSet<String>,
    #[serde(default)]
    constraints: BTreeSet<String>,
    #[serde(default)]
    team_size: Option<TeamSize>,
}

fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

impl ContextFingerprint {
    pub fn builder() -> FingerprintBuilder {
        FingerprintBuilder::default()
    }

    pub fn categories(&self) -> &BTreeSet<String> {
        &self.categories
    }

    pub fn technologies(&self) -> &BTreeSet<String> {
        &self.technologies
    }

    pub fn constraints(&self) -> &BTreeSet<String> {
        &self.constraints
    }

    pub fn scale(&self) -> Option<ProjectScale> {
        self.scale
    }

    pub fn team_size(&self) -> Option<TeamSize> {
        self.team_size
    }

    pub fn is_empty(&self) -> bool {
        self.populated_fields() == 0
    }

    pub fn populated_fields(&self) -> usize {
        [
            !self.categories.is_empty(),
            self.scale.is_some(),
            !self.technologies.is_empty(),
            !self.constraints.is_empty(),
            self.team_size.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count()
    }

    /// Stable content digest; equal fingerprints share one graph node.
    pub fn digest(&self) -> String {
        // BTreeSet keeps serialization order canonical
        let body = serde_json::to_string(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(body.as_bytes()))
    }

    /// Weighted overlap across all fields, in `[0, 1]`.
    ///
    /// An empty fingerprint on either side scores 0. Fields empty on both sides
    /// are left out of the weighting; fields empty on one side score 0.
    pub fn similarity(&self, other: &Self) -> f64 {
        if self.is_empty() || other.is_empty() {
            return 0.0;
        }

        let fields = [
            (CATEGORY_WEIGHT, set_overlap(&self.categories, &other.categories)),
            (TECHNOLOGY_WEIGHT, set_overlap(&self.technologies, &other.technologies)),
            (CONSTRAINT_WEIGHT, set_overlap(&self.constraints, &other.constraints)),
            (
                SCALE_WEIGHT,
                ordinal_overlap(self.scale.map(ProjectScale::rank), other.scale.map(ProjectScale::rank)),
            ),
            (
                TEAM_WEIGHT,
                ordinal_overlap(self.team_size.map(TeamSize::rank), other.team_size.map(TeamSize::rank)),
            ),
        ];

        let (weighted, total) = fields
            .iter()
            .filter_map(|(w, score)| score.map(|s| (w * s, *w)))
            .fold((0.0, 0.0), |(acc, tot), (ws, w)| (acc + ws, tot + w));

        if total == 0.0 {
            0.0
        } else {
            (weighted / total).clamp(0.0, 1.0)
        }
    }

    pub fn matches(&self, other: &Self, threshold: f64) -> bool {
        self.similarity(other) >= threshold
    }
}

/// Jaccard overlap; `None` when both sets are empty.
fn set_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<f64> {
    if a.is_empty() && b.is_empty() {
        return None;
    }
    let union = a.union(b).count();
    let intersection = a.intersection(b).count();
    Some(intersection as f64 / union as f64)
}

/// 1.0 equal, 0.5 adjacent, 0.0 otherwise; `None` when both are unset.
fn ordinal_overlap(a: Option<i32>, b: Option<i32>) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (Some(x), Some(y)) => Some(match (x - y).abs() {
            0 => 1.0,
            1 => 0.5,
            _ => 0.0,
        }),
        _ => Some(0.0),
    }
}

#[derive(Debug, Default)]
pub struct FingerprintBuilder {
    inner: ContextFingerprint,
}

impl FingerprintBuilder {
    pub fn categories<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.categories = normalize_tags(tags);
        self
    }

    pub fn technologies<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.technologies = normalize_tags(tags);
        self
    }

    pub fn constraints<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.constraints = normalize_tags(tags);
        self
    }

    pub fn scale(mut self, scale: ProjectScale) -> Self {
        self.inner.scale = Some(scale);
        self
    }

    pub fn team_size(mut self, team_size: TeamSize) -> Self {
        self.inner.team_size = Some(team_size);
        self
    }

    pub fn build(self) -> ContextFingerprint {
        self.inner
    }
}
