//! Keyword-triggered automatic answers.
//!
//! Flows are read from a TOML file:
//!
//! ```toml
//! [[flow]]
//! keywords = ["hola", "buenas"]
//! answers = ["¡Buenas!", "¿En qué te ayudo?"]
//!
//! [[flow]]
//! keywords = ["PRECIO"]
//! answers = ["Consulta la web."]
//! sensitive = true
//! ```
//!
//! A message matches when its trimmed body equals a keyword. Matching ignores
//! case unless the entry sets `sensitive`. The first matching entry wins.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct FlowEntry {
    pub keywords: Vec<String>,
    pub answers: Vec<String>,
    #[serde(default)]
    pub sensitive: bool,
}

impl FlowEntry {
    fn matches(&self, body: &str) -> bool {
        self.keywords.iter().any(|k| {
            let k = k.trim();
            if self.sensitive {
                k == body
            } else {
                k.to_lowercase() == body.to_lowercase()
            }
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Flow {
    #[serde(default, rename = "flow")]
    entries: Vec<FlowEntry>,
}

impl Flow {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let flow: Flow = toml::from_str(text)?;
        Ok(flow)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading flow file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing flow file {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Answers for an inbound message body, if any entry matches.
    pub fn answers_for(&self, body: &str) -> Option<&[String]> {
        let body = body.trim();
        if body.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.matches(body))
            .map(|e| e.answers.as_slice())
    }
}
