use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RecordFeedbackParams {
    #[schemars(description = "ID of the fragment that was applied")]
    pub fragment_id: String,

    #[schemars(description = "ID of the reporting agent instance")]
    pub instance_id: String,

    #[schemars(description = "Outcome: helpful, partially_helpful, not_helpful, harmful")]
    pub outcome: String,
}
