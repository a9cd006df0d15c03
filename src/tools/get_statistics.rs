use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GetStatisticsParams {
    #[schemars(description = "Agent type to report on")]
    pub agent_type: String,

    #[schemars(description = "Leave out fragments scoped to other projects")]
    pub project_id: Option<String>,
}
