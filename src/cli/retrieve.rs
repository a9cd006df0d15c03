use anyhow::Result;

use crate::config::CairnConfig;
use crate::memory::fingerprint::ContextFingerprint;
use crate::memory::{RetrievalRequest, RetrievalWarning};

pub struct RetrieveArgs<'a> {
    pub query: &'a str,
    pub agent_type: &'a str,
    pub technologies: &'a [String],
    pub categories: &'a [String],
    pub project: Option<&'a str>,
    pub limit: Option<usize>,
    pub historical: bool,
}

/// Run a retrieval from the terminal and print the ranked fragments.
pub async fn retrieve(config: CairnConfig, args: RetrieveArgs<'_>) -> Result<()> {
    let memory = crate::server::open_memory(config)?;

    let context = ContextFingerprint::builder()
        .technologies(args.technologies)
        .categories(args.categories)
        .build();
    let mut request = RetrievalRequest::new(args.query, args.agent_type, context);
    request.project_id = args.project.map(String::from);
    request.limit = args.limit;
    request.include_historical = args.historical;

    let result = memory.retrieve(request).await?;

    if result.fragments.is_empty() {
        println!("No fragments found.");
    }

    for (i, ranked) in result.fragments.iter().enumerate() {
        let f = &ranked.fragment;
        println!(
            "  {}. [{}] {} (quality: {:.2}, score: {:.4})",
            i + 1,
            f.kind,
            f.id,
            f.quality_score,
            ranked.score,
        );
        println!("     {}", f.content.pattern);
        println!();
    }

    for warning in &result.warnings {
        match warning {
            RetrievalWarning::ConflictUnresolved {
                fragment_id,
                conflict_id,
                other,
            } => println!("warning: {fragment_id} conflicts with {other} (unresolved, {conflict_id})"),
            RetrievalWarning::Corrupted {
                fragment_id,
                reason,
            } => println!("warning: {fragment_id} skipped, corrupted: {reason}"),
        }
    }

    Ok(())
}
