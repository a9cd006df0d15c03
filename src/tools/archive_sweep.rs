use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveSweepParams {
    #[schemars(description = "Archive fragments not validated for this many days. Defaults to 180.")]
    pub max_age_days: Option<i64>,

    #[schemars(description = "Archive only fragments scoring below this. Defaults to 0.3.")]
    pub min_quality: Option<f64>,
}
