//! MCP `store_memory` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::context::ContextParams;
use crate::memory::types::{parse_ts, FragmentContent, KnowledgeKind, NewFragment, Scope};

/// Parameters for the `store_memory` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StoreMemoryParams {
    #[schemars(description = "Agent type that owns the fragment, e.g. 'backend-architect'")]
    pub agent_type: String,

    #[schemars(description = "ID of the submitting agent instance")]
    pub instance_id: String,

    #[schemars(description = "Knowledge kind: procedural, declarative, meta, anti_pattern")]
    pub kind: String,

    #[schemars(description = "One-line statement of the recommendation")]
    pub pattern: String,

    #[schemars(description = "Why the recommendation holds")]
    pub reasoning: String,

    #[schemars(description = "Situation the recommendation was learned in")]
    pub situation: Option<String>,

    #[schemars(description = "Concrete approach to take")]
    pub approach: Option<String>,

    #[schemars(description = "Alternatives that were considered")]
    pub alternatives: Option<Vec<String>>,

    #[schemars(description = "Conditions under which the recommendation does not apply")]
    pub not_applicable_when: Option<Vec<String>>,

    #[schemars(description = "Context the fragment applies in")]
    pub context: Option<ContextParams>,

    #[schemars(description = "Scope: contextual (default), universal, or project")]
    pub scope: Option<String>,

    #[schemars(description = "Project ID; required when scope is 'project'")]
    pub project_id: Option<String>,

    #[schemars(description = "Submitter confidence (0.0-1.0)")]
    pub confidence: Option<f64>,

    #[schemars(description = "Seed quality score (0.0-1.0), e.g. for imported or synthesized fragments; capped at 0.95")]
    pub initial_quality: Option<f64>,

    #[schemars(description = "Start of validity as RFC 3339; defaults to now")]
    pub valid_from: Option<String>,

    #[schemars(description = "End of validity as RFC 3339")]
    pub valid_until: Option<String>,

    #[schemars(description = "ID of a fragment this one explicitly replaces")]
    pub replaces: Option<String>,

    #[schemars(description = "Related fragments owned by other agent types")]
    pub cross_type_refs: Option<Vec<String>>,

    #[schemars(description = "Additional instances that co-authored the fragment")]
    pub contributors: Option<Vec<String>>,
}

fn timestamp(field: &str, value: Option<&str>) -> Result<Option<chrono::DateTime<chrono::Utc>>, String> {
    value
        .map(|v| parse_ts(v).ok_or_else(|| format!("{field} is not an RFC 3339 timestamp: {v}")))
        .transpose()
}

impl StoreMemoryParams {
    /// Parse the loosely typed tool input into a submission.
    ///
    /// Field-level checks (required text, score ranges, validity order) are
    /// left to [`NewFragment::validate`].
    pub fn into_submission(self) -> Result<NewFragment, String> {
        let kind: KnowledgeKind = self.kind.trim().parse()?;
        let scope = Scope::from_parts(self.scope.as_deref().unwrap_or("contextual"), self.project_id)?;
        let fingerprint = self.context.unwrap_or_default().into_fingerprint()?;
        let valid_from = timestamp("valid_from", self.valid_from.as_deref())?;
        let valid_until = timestamp("valid_until", self.valid_until.as_deref())?;

        let mut content = FragmentContent::new(self.pattern, self.reasoning)
            .with_alternatives(self.alternatives.unwrap_or_default())
            .with_not_applicable_when(self.not_applicable_when.unwrap_or_default());
        if let Some(situation) = self.situation {
            content = content.with_situation(situation);
        }
        if let Some(approach) = self.approach {
            content = content.with_approach(approach);
        }

        let mut new = NewFragment::new(self.agent_type, self.instance_id, kind, content)
            .with_fingerprint(fingerprint)
            .with_scope(scope)
            .with_validity(valid_from, valid_until);
        if let Some(confidence) = self.confidence {
            new = new.with_confidence(confidence);
        }
        if let Some(quality) = self.initial_quality {
            new = new.with_initial_quality(quality);
        }
        if let Some(replaces) = self.replaces {
            new = new.replacing(replaces);
        }
        new.cross_type_refs = self.cross_type_refs.unwrap_or_default();
        new.contributors = self.contributors.unwrap_or_default();
        Ok(new)
    }
}
