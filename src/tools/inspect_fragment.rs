use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct InspectFragmentParams {
    #[schemars(description = "ID of the fragment to inspect")]
    pub id: String,

    #[schemars(description = "If true, include quality history, audit log and conflicts")]
    pub include_history: Option<bool>,
}
