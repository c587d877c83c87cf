use crate::error::{Result, ToolError};
use crate::traits::{RiskLevel, Tool, ToolSpec, require_string};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Append-only markdown file of operator-confirmed facts about the fleet.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    path: PathBuf,
}

impl KnowledgeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whole file contents; empty when the file does not exist yet.
    pub async fn load(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(level = "info", skip(self, content), fields(path = %self.path.display()))]
    pub async fn save(&self, topic: &str, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let entry = format!("\n- **{}**: {}", topic.trim(), content.trim());
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

pub struct SaveKnowledgeTool {
    store: KnowledgeStore,
}

impl SaveKnowledgeTool {
    pub fn new(store: KnowledgeStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SaveKnowledgeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "save_knowledge".to_string(),
            description: "Remember a fact about the servers for future diagnoses.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "topic": {"type": "string", "description": "Short subject, e.g. a service name"},
                    "content": {"type": "string", "description": "The fact to remember"}
                },
                "required": ["topic", "content"]
            }),
            risk_level: RiskLevel::Low,
        }
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let topic = require_string(&arguments, "topic")?;
        let content = require_string(&arguments, "content")?;
        if topic.trim().is_empty() || content.trim().is_empty() {
            return Err(ToolError::InvalidArguments(
                "topic and content must not be empty".to_string(),
            ));
        }
        self.store.save(&topic, &content).await?;
        Ok(serde_json::json!({
            "saved": true,
            "message": format!("Saved to knowledge base: {}", topic.trim()),
        }))
    }
}
