//! External debate oracle for conflicts that cannot be resolved automatically.
//!
//! The oracle receives both fragments and the disputed context and answers
//! with a winner or a synthesized consensus fragment. The conflict engine
//! bounds every call with a timeout; this module only defines the contract
//! and its transports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::fingerprint::ContextFingerprint;
use super::types::{ConflictType, FragmentId, MemoryFragment, NewFragment};
use crate::config::ConflictConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateRequest {
    pub conflict_id: String,
    pub agent_type: String,
    pub conflict_type: ConflictType,
    pub fragment_a: MemoryFragment,
    pub fragment_b: MemoryFragment,
    /// Context of the newer fragment.
    pub context: ContextFingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum DebateVerdict {
    /// One of the two fragments should survive.
    Winner { fragment_id: FragmentId },
    /// Neither survives; this synthesized fragment replaces both.
    Consensus { fragment: NewFragment },
}

#[async_trait]
pub trait DebateOracle: Send + Sync {
    async fn debate(&self, request: DebateRequest) -> Result<DebateVerdict>;

    fn name(&self) -> &str;
}

/// Used when no oracle is configured; every debate escalates.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableOracle;

#[async_trait]
impl DebateOracle for UnavailableOracle {
    async fn debate(&self, request: DebateRequest) -> Result<DebateVerdict> {
        anyhow::bail!("no debate oracle configured for conflict {}", request.conflict_id)
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

/// Posts the [`DebateRequest`] as JSON and expects a [`DebateVerdict`] back.
pub struct HttpDebateOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpDebateOracle {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build oracle HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DebateOracle for HttpDebateOracle {
    async fn debate(&self, request: DebateRequest) -> Result<DebateVerdict> {
        tracing::debug!(url = %self.url, conflict = %request.conflict_id, "requesting debate");
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("debate request to {} failed", self.url))?;

        anyhow::ensure!(
            response.status().is_success(),
            "debate oracle answered HTTP {}",
            response.status()
        );

        response
            .json::<DebateVerdict>()
            .await
            .context("debate oracle returned an unreadable verdict")
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// HTTP oracle when `oracle_url` is set, otherwise [`UnavailableOracle`].
pub fn create_oracle(config: &ConflictConfig) -> Result<Arc<dyn DebateOracle>> {
    match config.oracle_url.as_deref() {
        Some(url) if !url.trim().is_empty() => Ok(Arc::new(HttpDebateOracle::new(
            url,
            Duration::from_secs(config.oracle_timeout_secs),
        )?)),
        _ => Ok(Arc::new(UnavailableOracle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{FragmentContent, KnowledgeKind};

    fn request() -> DebateRequest {
        let t = crate::memory::types::now();
        let fragment = |id: &str| MemoryFragment {
            id: id.into(),
            agent_type: "architect".into(),
            kind: KnowledgeKind::Procedural,
            content: FragmentContent::new(format!("pattern {id}"), "reason"),
            quality_score: 0.7,
            quality: crate::memory::types::QualityScores {
                confidence: 0.5,
                validation: 0.0,
                recency: 1.0,
                consensus: 0.25,
                context_specificity: 0.2,
                impact: 0.5,
            },
            fingerprint: ContextFingerprint::default(),
            usage: Default::default(),
            contributors: vec!["a1".into()],
            temporal: crate::memory::types::TemporalMetadata {
                created_at: t,
                last_validated_at: t,
                valid_from: t,
                valid_until: None,
                deprecated_at: None,
            },
            supersedes: vec![],
            superseded_by: None,
            replaces: None,
            conflicts: vec![],
            scope: Default::default(),
            cross_type_refs: vec![],
            archived_at: None,
            version: 1,
        };
        DebateRequest {
            conflict_id: "c1".into(),
            agent_type: "architect".into(),
            conflict_type: ConflictType::Direct,
            fragment_a: fragment("a"),
            fragment_b: fragment("b"),
            context: ContextFingerprint::default(),
        }
    }

    #[tokio::test]
    async fn unavailable_oracle_always_fails() {
        assert!(UnavailableOracle.debate(request()).await.is_err());
    }

    #[test]
    fn verdicts_use_tagged_json() {
        let json = r#"{"verdict":"winner","fragment_id":"b"}"#;
        let verdict: DebateVerdict = serde_json::from_str(json).unwrap();
        assert_eq!(verdict, DebateVerdict::Winner { fragment_id: "b".into() });

        let consensus = DebateVerdict::Consensus {
            fragment: NewFragment::new(
                "architect",
                "oracle",
                KnowledgeKind::Procedural,
                FragmentContent::new("combine both", "each fits a case"),
            ),
        };
        let round_trip: DebateVerdict =
            serde_json::from_str(&serde_json::to_string(&consensus).unwrap()).unwrap();
        assert_eq!(round_trip, consensus);
    }

    #[test]
    fn oracle_selection_follows_config() {
        let mut config = ConflictConfig::default();
        assert_eq!(create_oracle(&config).unwrap().name(), "unavailable");
        config.oracle_url = Some("http://127.0.0.1:9/debate".into());
        assert_eq!(create_oracle(&config).unwrap().name(), "http");
    }

    #[tokio::test]
    async fn http_oracle_posts_request_and_reads_verdict() {
        use axum::{routing::post, Json, Router};

        async fn judge(Json(req): Json<DebateRequest>) -> Json<DebateVerdict> {
            Json(DebateVerdict::Winner {
                fragment_id: req.fragment_b.id,
            })
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/debate", post(judge)))
                .await
                .unwrap();
        });

        let oracle =
            HttpDebateOracle::new(format!("http://{addr}/debate"), Duration::from_secs(5)).unwrap();
        let verdict = oracle.debate(request()).await.unwrap();
        assert_eq!(verdict, DebateVerdict::Winner { fragment_id: "b".into() });
    }
}
