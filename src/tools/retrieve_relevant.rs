use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::context::ContextParams;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RetrieveRelevantParams {
    #[schemars(description = "Natural language description of the task at hand")]
    pub query: String,

    #[schemars(description = "Agent type whose memory to search")]
    pub agent_type: String,

    #[schemars(description = "Context of the current task")]
    pub context: Option<ContextParams>,

    #[schemars(description = "Caller's project; unlocks project-scoped fragments")]
    pub project_id: Option<String>,

    #[schemars(description = "Maximum number of fragments to return. Defaults to 10.")]
    pub limit: Option<usize>,

    #[schemars(description = "If true, include expired, superseded and archived fragments")]
    pub include_historical: Option<bool>,
}
