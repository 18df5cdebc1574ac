use std::path::Path;

use anyhow::Context as _;

/// Source term → target term, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Glossary {
    entries: Vec<(String, String)>,
}

impl Glossary {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut glossary = Self::default();
        for (source, target) in pairs {
            glossary.insert(source.into(), target.into());
        }
        glossary
    }

    /// Inserts or replaces a mapping; a replaced term keeps its original position.
    pub fn insert(&mut self, source: String, target: String) {
        if let Some(entry) = self.entries.iter_mut().find(|(s, _)| *s == source) {
            entry.1 = target;
            return;
        }
        self.entries.push((source, target));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw).context("parse glossary json")?;
        let object = value
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("glossary must be a JSON object"))?;

        let mut glossary = Self::default();
        for (source, target) in object {
            let Some(target) = target.as_str() else {
                tracing::warn!(term = %source, "glossary value is not a string; skipping");
                continue;
            };
            let source = source.trim();
            let target = target.trim();
            if source.is_empty() || target.is_empty() {
                continue;
            }
            glossary.insert(source.to_owned(), target.to_owned());
        }
        Ok(glossary)
    }

    /// Loads a glossary file. A missing path or file yields an empty glossary.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::info!(path = %path.display(), "glossary file not found; continuing without glossary");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read glossary: {}", path.display()))?;
        let glossary = Self::parse_json(&raw)
            .with_context(|| format!("load glossary: {}", path.display()))?;
        tracing::info!(path = %path.display(), terms = glossary.len(), "loaded glossary");
        Ok(glossary)
    }
}
