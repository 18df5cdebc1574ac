use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::fs;

/// Translated chapters of one run, persisted after every finished chapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub config_hash: String,
    #[serde(default)]
    pub completed_chapters: BTreeMap<String, String>,
    /// Chapter names in completion order.
    #[serde(default)]
    pub chapter_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `{dir}/{output_stem}.checkpoint.json` next to the output file.
pub fn checkpoint_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_owned());
    output.with_file_name(format!("{stem}.checkpoint.json"))
}

/// Fingerprint of the settings that make a checkpoint reusable.
pub fn fingerprint(input: &Path, model: &str, chunk_size: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    hasher.update(chunk_size.to_string().as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}

impl Checkpoint {
    pub fn new(config_hash: impl Into<String>) -> Self {
        Self {
            config_hash: config_hash.into(),
            ..Default::default()
        }
    }

    pub async fn load(path: &Path) -> anyhow::Result<Option<Self>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read checkpoint: {}", path.display()));
            }
        };
        let checkpoint = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse checkpoint: {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Loads the checkpoint if it was written with the same fingerprint; otherwise starts over.
    pub async fn resume(path: &Path, config_hash: &str) -> anyhow::Result<Self> {
        match Self::load(path).await? {
            Some(checkpoint) if checkpoint.config_hash == config_hash => {
                tracing::info!(
                    path = %path.display(),
                    chapters = checkpoint.len(),
                    "resuming from checkpoint"
                );
                Ok(checkpoint)
            }
            Some(checkpoint) => {
                tracing::warn!(
                    path = %path.display(),
                    expected = config_hash,
                    found = %checkpoint.config_hash,
                    "checkpoint fingerprint mismatch; starting fresh"
                );
                Ok(Self::new(config_hash))
            }
            None => Ok(Self::new(config_hash)),
        }
    }

    pub fn record(&mut self, name: &str, text: String) {
        if !self.completed_chapters.contains_key(name) {
            self.chapter_order.push(name.to_owned());
        }
        self.completed_chapters.insert(name.to_owned(), text);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.completed_chapters.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.completed_chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed_chapters.is_empty()
    }

    /// Chapters in completion order; entries missing from the order list come last, by name.
    pub fn chapters(&self) -> Vec<(&str, &str)> {
        let mut out = self
            .chapter_order
            .iter()
            .filter_map(|name| Some((name.as_str(), self.get(name)?)))
            .collect::<Vec<_>>();
        for (name, text) in &self.completed_chapters {
            if !self.chapter_order.contains(name) {
                out.push((name.as_str(), text.as_str()));
            }
        }
        out
    }

    pub async fn save(&mut self, path: &Path) -> anyhow::Result<()> {
        self.updated_at = Some(Utc::now());
        write_json_atomic(path, self).await
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create parent dir: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize checkpoint")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_sits_next_to_output() {
        assert_eq!(
            checkpoint_path(Path::new("/out/book_zh.epub")),
            PathBuf::from("/out/book_zh.checkpoint.json")
        );
    }

    #[test]
    fn fingerprint_depends_on_model_and_chunk_size() {
        let input = Path::new("book.epub");
        let base = fingerprint(input, "deepseek-chat", 1500);
        assert_eq!(base.len(), 16);
        assert_eq!(base, fingerprint(input, "deepseek-chat", 1500));
        assert_ne!(base, fingerprint(input, "deepseek-chat", 0));
        assert_ne!(base, fingerprint(input, "qwen3:8b", 1500));
    }

    #[tokio::test]
    async fn save_and_resume_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("book.checkpoint.json");

        let mut checkpoint = Checkpoint::new("abc");
        checkpoint.record("ch2.xhtml", "第二章".to_owned());
        checkpoint.record("ch1.xhtml", "第一章".to_owned());
        checkpoint.save(&path).await.expect("save");

        let resumed = Checkpoint::resume(&path, "abc").await.expect("resume");
        assert_eq!(resumed.len(), 2);
        assert!(resumed.updated_at.is_some());
        assert_eq!(
            resumed.chapters(),
            vec![("ch2.xhtml", "第二章"), ("ch1.xhtml", "第一章")]
        );
    }

    #[tokio::test]
    async fn mismatched_fingerprint_starts_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("book.checkpoint.json");
        let mut checkpoint = Checkpoint::new("old");
        checkpoint.record("ch1.xhtml", "第一章".to_owned());
        checkpoint.save(&path).await.expect("save");

        let resumed = Checkpoint::resume(&path, "new").await.expect("resume");
        assert!(resumed.is_empty());
        assert_eq!(resumed.config_hash, "new");
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = Checkpoint::load(&dir.path().join("none.json"))
            .await
            .expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn rerecording_keeps_original_position() {
        let mut checkpoint = Checkpoint::new("h");
        checkpoint.record("a", "1".to_owned());
        checkpoint.record("b", "2".to_owned());
        checkpoint.record("a", "3".to_owned());
        assert_eq!(checkpoint.chapters(), vec![("a", "3"), ("b", "2")]);
    }
}
