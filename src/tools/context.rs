//! Context fingerprint as it appears in tool parameters.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::memory::fingerprint::{ContextFingerprint, ProjectScale, TeamSize};

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ContextParams {
    #[schemars(description = "Task categories, e.g. 'api-design', 'error-handling'")]
    #[serde(default)]
    pub categories: Vec<String>,

    #[schemars(description = "Technologies in play, e.g. 'python', 'postgres'")]
    #[serde(default)]
    pub technologies: Vec<String>,

    #[schemars(description = "Constraints, e.g. 'low-latency', 'offline'")]
    #[serde(default)]
    pub constraints: Vec<String>,

    #[schemars(description = "Project scale: prototype, small, medium, large, enterprise")]
    pub scale: Option<String>,

    #[schemars(description = "Team size: solo, small, medium, large")]
    pub team_size: Option<String>,
}

impl ContextParams {
    pub fn into_fingerprint(self) -> Result<ContextFingerprint, String> {
        let mut builder = ContextFingerprint::builder()
            .categories(&self.categories)
            .technologies(&self.technologies)
            .constraints(&self.constraints);
        if let Some(scale) = self.scale.as_deref() {
            builder = builder.scale(scale.parse::<ProjectScale>()?);
        }
        if let Some(team) = self.team_size.as_deref() {
            builder = builder.team_size(team.parse::<TeamSize>()?);
        }
        Ok(builder.build())
    }
}
