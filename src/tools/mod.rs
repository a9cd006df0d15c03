pub mod archive_sweep;
pub mod context;
pub mod get_statistics;
pub mod inspect_fragment;
pub mod record_feedback;
pub mod retrieve_relevant;
pub mod store_memory;

use archive_sweep::ArchiveSweepParams;
use get_statistics::GetStatisticsParams;
use inspect_fragment::InspectFragmentParams;
use record_feedback::RecordFeedbackParams;
use retrieve_relevant::RetrieveRelevantParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Serialize;
use store_memory::StoreMemoryParams;

use crate::memory::types::FeedbackOutcome;
use crate::memory::{RetrievalRequest, SharedMemory};

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

/// The Cairn MCP tool handler. Wraps a [`SharedMemory`] and exposes its
/// operations via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct CairnTools {
    tool_router: ToolRouter<Self>,
    memory: SharedMemory,
}

#[tool_router]
impl CairnTools {
    pub fn new(memory: SharedMemory) -> Self {
        Self {
            tool_router: Self::tool_router(),
            memory,
        }
    }

    /// Contribute a knowledge fragment to the shared memory of an agent type.
    #[tool(description = "Store a knowledge fragment for an agent type. Kinds: procedural (how-to), declarative (facts), meta (how to apply knowledge), anti_pattern (what not to do). Conflicts with existing fragments are detected and resolved in the background.")]
    async fn store_memory(
        &self,
        Parameters(params): Parameters<StoreMemoryParams>,
    ) -> Result<String, String> {
        let new = params.into_submission()?;

        tracing::info!(
            agent_type = %new.agent_type,
            kind = %new.kind,
            scope = %new.scope,
            "store_memory called"
        );

        let id = self
            .memory
            .store_memory(new)
            .await
            .map_err(|e| format!("store failed: {e}"))?;

        Ok(serde_json::json!({ "id": id }).to_string())
    }

    /// Retrieve ranked fragments for a task.
    #[tool(description = "Retrieve the fragments most relevant to a task, ranked by quality, context match and recency. Unresolved conflicts are reported as warnings.")]
    async fn retrieve_relevant(
        &self,
        Parameters(params): Parameters<RetrieveRelevantParams>,
    ) -> Result<String, String> {
        let context = params.context.unwrap_or_default().into_fingerprint()?;

        tracing::info!(
            agent_type = %params.agent_type,
            query_len = params.query.len(),
            "retrieve_relevant called"
        );

        let mut request = RetrievalRequest::new(params.query, params.agent_type, context);
        request.project_id = params.project_id;
        request.limit = params.limit;
        request.include_historical = params.include_historical.unwrap_or(false);

        let result = self
            .memory
            .retrieve(request)
            .await
            .map_err(|e| format!("retrieval failed: {e}"))?;

        to_json(&result)
    }

    /// Report how a fragment worked out.
    #[tool(description = "Record feedback after applying a fragment: helpful, partially_helpful, not_helpful or harmful. Adjusts the fragment's quality and its contributors' reputation.")]
    async fn record_feedback(
        &self,
        Parameters(params): Parameters<RecordFeedbackParams>,
    ) -> Result<String, String> {
        let outcome: FeedbackOutcome = params.outcome.trim().parse()?;

        tracing::info!(id = %params.fragment_id, outcome = %outcome, "record_feedback called");

        let quality_score = self
            .memory
            .record_feedback(&params.fragment_id, &params.instance_id, outcome)
            .await
            .map_err(|e| format!("feedback failed: {e}"))?;

        Ok(serde_json::json!({
            "id": params.fragment_id,
            "quality_score": quality_score,
        })
        .to_string())
    }

    #[tool(description = "Get memory statistics for an agent type: fragment counts by state and kind, average quality, conflicts by status.")]
    async fn get_statistics(
        &self,
        Parameters(params): Parameters<GetStatisticsParams>,
    ) -> Result<String, String> {
        tracing::info!(agent_type = %params.agent_type, "get_statistics called");

        let stats = self
            .memory
            .get_statistics(&params.agent_type, params.project_id.as_deref())
            .await
            .map_err(|e| format!("statistics failed: {e}"))?;

        to_json(&stats)
    }

    #[tool(description = "Archive stale, low-quality, rarely used fragments. Archived fragments stay in the graph but drop out of default retrieval.")]
    async fn archive_sweep(
        &self,
        Parameters(params): Parameters<ArchiveSweepParams>,
    ) -> Result<String, String> {
        let defaults = &self.memory.config().maintenance;
        let max_age_days = params.max_age_days.unwrap_or(defaults.archive_max_age_days);
        let min_quality = params.min_quality.unwrap_or(defaults.archive_min_quality);

        tracing::info!(max_age_days, min_quality, "archive_sweep called");

        let archived = self
            .memory
            .archive_sweep(chrono::Duration::days(max_age_days), min_quality)
            .await
            .map_err(|e| format!("archive sweep failed: {e}"))?;

        Ok(serde_json::json!({
            "archived": archived,
            "count": archived.len(),
        })
        .to_string())
    }

    #[tool(description = "Inspect a fragment by ID. Optionally includes its quality history, audit log and conflicts.")]
    async fn inspect_fragment(
        &self,
        Parameters(params): Parameters<InspectFragmentParams>,
    ) -> Result<String, String> {
        tracing::info!(id = %params.id, "inspect_fragment called");

        if params.include_history.unwrap_or(false) {
            let inspection = self
                .memory
                .inspect(&params.id)
                .await
                .map_err(|e| format!("inspect failed: {e}"))?;
            to_json(&inspection)
        } else {
            let fragment = self
                .memory
                .get_fragment(&params.id)
                .await
                .map_err(|e| format!("inspect failed: {e}"))?;
            to_json(&fragment)
        }
    }
}

#[tool_handler]
impl ServerHandler for CairnTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Cairn is a shared memory graph for agent types. Use retrieve_relevant before \
                 a task, store_memory to contribute what you learned, and record_feedback \
                 after applying a fragment."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
