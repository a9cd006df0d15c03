pub mod conflicts;
pub mod doctor;
pub mod inspect;
pub mod maintenance;
pub mod retrieve;
pub mod stats;

use std::path::Path;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::config::EmbeddingConfig;

const HF_BASE: &str = "https://huggingface.co/sentence-transformers";

/// Files the local embedding provider loads, relative to the model repository.
const MODEL_FILES: &[(&str, &str)] = &[
    ("onnx/model.onnx", "model.onnx"),
    ("tokenizer.json", "tokenizer.json"),
];

/// Fetch the configured ONNX model and its tokenizer into the cache directory.
/// Files already present are left alone.
pub async fn model_download(config: &EmbeddingConfig) -> Result<()> {
    let cache_dir = crate::config::expand_tilde(&config.cache_dir);
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create cache dir: {}", cache_dir.display()))?;

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    for (remote, local) in MODEL_FILES {
        let dest = cache_dir.join(local);
        if dest.exists() {
            println!("{local} already present at {}", dest.display());
            continue;
        }
        let url = format!("{HF_BASE}/{}/resolve/main/{remote}", config.model);
        println!("Downloading {local} for {}...", config.model);
        download_file(&client, &url, &dest).await?;
        println!("Saved {}", dest.display());
    }

    println!("Embedding model ready.");
    Ok(())
}

/// Stream `url` to `dest` with a progress bar, writing to a temp file first.
async fn download_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "download of {url} failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => ProgressBar::new(size).with_style(
            ProgressStyle::default_bar()
                .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")?
                .progress_chars("##-"),
        ),
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    while let Some(chunk) = response.chunk().await.context("error reading response")? {
        file.write_all(&chunk).await.context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to move download into place")?;

    pb.finish_and_clear();
    Ok(())
}
