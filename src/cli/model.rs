//! `memkeep model download`: fetch the ONNX model and tokenizer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::config::EmbeddingConfig;
use crate::embedding::local::model_paths;

const MODEL_URL: &str =
    "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/onnx/model.onnx";
const TOKENIZER_URL: &str =
    "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/tokenizer.json";

#[derive(Debug, Serialize)]
pub struct DownloadReport {
    pub model: String,
    pub tokenizer: String,
    /// Files fetched by this call; empty when both were already cached.
    pub downloaded: Vec<String>,
}

/// Download the model and tokenizer into `embedding.cache_dir`, skipping files already present.
pub async fn model_download(config: &EmbeddingConfig) -> Result<DownloadReport> {
    let (model_path, tokenizer_path) = model_paths(config);
    if let Some(dir) = model_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create cache dir: {}", dir.display()))?;
    }

    let mut downloaded = Vec::new();
    for (url, dest, label) in [
        (MODEL_URL, &model_path, "model.onnx (~90MB)"),
        (TOKENIZER_URL, &tokenizer_path, "tokenizer.json"),
    ] {
        if dest.exists() {
            tracing::info!(path = %dest.display(), "already cached");
            continue;
        }
        eprintln!("Downloading {label}...");
        download_file(url, dest).await?;
        downloaded.push(dest.display().to_string());
    }

    Ok(DownloadReport {
        model: model_path.display().to_string(),
        tokenizer: tokenizer_path.display().to_string(),
        downloaded,
    })
}

/// Stream `url` to `dest` through a `.tmp` sibling, renamed into place when complete.
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    let mut response = reqwest::get(url)
        .await
        .with_context(|| format!("HTTP request failed for {url}"))?;

    anyhow::ensure!(
        response.status().is_success(),
        "download failed with HTTP {}",
        response.status()
    );

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
                    .context("invalid progress template")?
                    .progress_chars("##-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = tmp_path_for(dest);
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

    while let Some(chunk) = response.chunk().await.context("error reading response")? {
        file.write_all(&chunk)
            .await
            .context("error writing to file")?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to rename temp file")?;

    pb.finish_and_clear();
    Ok(())
}

fn tmp_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_path_keeps_original_extension() {
        let tmp = tmp_path_for(Path::new("/cache/model.onnx"));
        assert_eq!(tmp, PathBuf::from("/cache/model.onnx.tmp"));
    }

    #[tokio::test]
    async fn cached_files_are_not_fetched() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("model.onnx"), b"x").unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), b"{}").unwrap();
        let config = EmbeddingConfig {
            cache_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let report = model_download(&config).await.unwrap();
        assert!(report.downloaded.is_empty());
        assert!(report.model.ends_with("model.onnx"));
    }
}
