use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Target-language codes and the labels sent to the analysis service.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    codes: HashMap<String, String>,
    variants: HashMap<String, String>,
}

impl LanguageRegistry {
    pub fn load() -> Result<Self> {
        let raw = include_str!("languages.json");
        let parsed: LanguageData =
            serde_json::from_str(raw).with_context(|| "failed to parse language data")?;
        Ok(LanguageRegistry {
            codes: parsed.codes,
            variants: parsed.variants,
        })
    }

    pub fn is_valid_code(&self, code: &str) -> bool {
        let code = normalize_code(code);
        self.codes.contains_key(&code) || self.variants.contains_key(&code)
    }

    /// Human label for `code`; unknown codes are passed through unchanged so
    /// the service can still interpret them.
    pub fn label(&self, code: &str) -> String {
        let normalized = normalize_code(code);
        if let Some(label) = self.variants.get(&normalized) {
            return label.clone();
        }
        if let Some(label) = self.codes.get(&normalized) {
            return label.clone();
        }
        let base = normalized.split('-').next().unwrap_or_default();
        self.codes
            .get(base)
            .cloned()
            .unwrap_or_else(|| code.trim().to_string())
    }

    pub fn codes(&self) -> Vec<(String, String)> {
        let mut entries = self
            .codes
            .iter()
            .chain(self.variants.iter())
            .map(|(code, label)| (code.clone(), label.clone()))
            .collect::<Vec<_>>();
        entries.sort();
        entries
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_lowercase().replace('_', "-")
}

#[derive(Debug, Deserialize)]
struct LanguageData {
    codes: HashMap<String, String>,
    #[serde(default)]
    variants: HashMap<String, String>,
}
