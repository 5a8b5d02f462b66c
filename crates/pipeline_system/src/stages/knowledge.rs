//! Knowledge injection
//!
//! Looks up entries relevant to the user input and appends them to the
//! system prompt. Search backends implement [`KnowledgeSource`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{fields, ids};
use crate::error::StageError;
use crate::stage::{FieldMap, FieldMapExt, Stage, StageDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub title: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub content: String,
}

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Up to `limit` entries relevant to `query`, best first.
    async fn lookup(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, StageError>;
}

/// In-memory entries matched by case-insensitive keyword hits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordKnowledgeBase {
    entries: Vec<KnowledgeEntry>,
}

impl KeywordKnowledgeBase {
    pub fn new(entries: Vec<KnowledgeEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KnowledgeSource for KeywordKnowledgeBase {
    async fn lookup(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, StageError> {
        let query = query.to_lowercase();
        let mut scored: Vec<(usize, &KnowledgeEntry)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let hits = entry
                    .keywords
                    .iter()
                    .filter(|keyword| !keyword.is_empty() && query.contains(&keyword.to_lowercase()))
                    .count();
                (hits > 0).then_some((hits, entry))
            })
            .collect();
        // Stable sort keeps declaration order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

pub struct KnowledgeInjectionStage {
    descriptor: StageDescriptor,
    source: Arc<dyn KnowledgeSource>,
    limit: usize,
}

impl KnowledgeInjectionStage {
    pub fn new(source: Arc<dyn KnowledgeSource>, limit: usize) -> Self {
        Self {
            descriptor: StageDescriptor::new(ids::KNOWLEDGE_INJECTION)
                .inputs([fields::SYSTEM_PROMPT, fields::USER_INPUT])
                .outputs([fields::SYSTEM_PROMPT, fields::KNOWLEDGE])
                .then(ids::MODEL_INVOCATION),
            source,
            limit,
        }
    }
}

#[async_trait]
impl Stage for KnowledgeInjectionStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn transform(&self, input: FieldMap) -> Result<FieldMap, StageError> {
        let mut system_prompt = input.require_str(fields::SYSTEM_PROMPT)?.to_string();
        let query = input.require_str(fields::USER_INPUT)?;

        let entries = if self.limit == 0 {
            Vec::new()
        } else {
            self.source.lookup(query, self.limit).await?
        };
        if !entries.is_empty() {
            tracing::debug!(count = entries.len(), "KnowledgeInjection: injecting entries");
            system_prompt.push_str("\n\nRelevant knowledge:");
            for entry in &entries {
                system_prompt.push_str(&format!("\n- {}: {}", entry.title, entry.content));
            }
        }

        let titles = entries
            .iter()
            .map(|entry| Value::String(entry.title.clone()))
            .collect();
        let mut output = FieldMap::new();
        output.insert(fields::SYSTEM_PROMPT.to_string(), Value::String(system_prompt));
        output.insert(fields::KNOWLEDGE.to_string(), Value::Array(titles));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(title: &str, keywords: &[&str]) -> KnowledgeEntry {
        KnowledgeEntry {
            title: title.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            content: format!("{title} lore"),
        }
    }

    #[tokio::test]
    async fn ranks_by_keyword_hits() {
        let kb = KeywordKnowledgeBase::new(vec![
            entry("Harbor", &["harbor", "ship"]),
            entry("Castle", &["castle"]),
            entry("Fleet", &["ship", "fleet", "harbor"]),
        ]);

        let found = kb.lookup("The SHIP leaves the harbor", 5).await.unwrap();
        let titles: Vec<_> = found.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Harbor", "Fleet"]);

        assert_eq!(kb.lookup("ship", 1).await.unwrap().len(), 1);
        assert!(kb.lookup("nothing relevant", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stage_appends_entries_to_system_prompt() {
        let kb = Arc::new(KeywordKnowledgeBase::new(vec![entry("Castle", &["castle"])]));
        let stage = KnowledgeInjectionStage::new(kb, 3);

        let mut input = FieldMap::new();
        input.insert("system_prompt".into(), "Narrate.".into());
        input.insert("user_input".into(), "go to the castle".into());
        let output = stage.transform(input).await.unwrap();

        assert_eq!(output["system_prompt"], "Narrate.\n\nRelevant knowledge:\n- Castle: Castle lore");
        assert_eq!(output["knowledge"], serde_json::json!(["Castle"]));
    }
}
