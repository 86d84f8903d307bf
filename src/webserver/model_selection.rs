//! Parsing of the client's model-config payload and the static model
//! catalog, including per-model pricing used for answer cost accounting.

use llm_client::clients::types::{LLMClientUsage, LLMType};
use serde::{Deserialize, Serialize};

/// What the client sends in `selectedModelConfig`. `capabilities` arrives
/// either as a list of strings or as a flag object, depending on client
/// version.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectedModelConfig {
    pub model: Option<String>,
    pub reasoning: bool,
    pub websearch: bool,
    pub deep_research: bool,
    pub capabilities: Option<Capabilities>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Capabilities {
    List(Vec<String>),
    Flags {
        #[serde(default)]
        reasoning: bool,
        #[serde(default)]
        websearch: bool,
        #[serde(default, rename = "deepResearch")]
        deep_research: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCatalogEntry {
    pub label_name: &'static str,
    pub reasoning: bool,
    pub websearch: bool,
    pub deep_research: bool,
    pub description: &'static str,
    #[serde(skip)]
    pub input_cost_per_million: f64,
    #[serde(skip)]
    pub output_cost_per_million: f64,
}

impl ModelCatalogEntry {
    pub fn llm_type(&self) -> LLMType {
        llm_type_for_label(self.label_name)
    }
}

pub fn llm_type_for_label(label: &str) -> LLMType {
    match label {
        "gpt-4o" => LLMType::Gpt4o,
        "gpt-4o-mini" => LLMType::Gpt4oMini,
        "o3-mini" => LLMType::O3Mini,
        "claude-sonnet" => LLMType::ClaudeSonnet,
        "claude-haiku" => LLMType::ClaudeHaiku,
        "deepseek-r1" => LLMType::DeepSeekR1,
        other => LLMType::Custom(other.to_owned()),
    }
}

pub fn model_catalog() -> Vec<ModelCatalogEntry> {
    vec![
        ModelCatalogEntry {
            label_name: "gpt-4o",
            reasoning: false,
            websearch: true,
            deep_research: false,
            description: "Balanced default for workspace questions",
            input_cost_per_million: 2.5,
            output_cost_per_million: 10.0,
        },
        ModelCatalogEntry {
            label_name: "gpt-4o-mini",
            reasoning: false,
            websearch: true,
            deep_research: false,
            description: "Fast and inexpensive",
            input_cost_per_million: 0.15,
            output_cost_per_million: 0.6,
        },
        ModelCatalogEntry {
            label_name: "o3-mini",
            reasoning: true,
            websearch: false,
            deep_research: true,
            description: "Reasoning model used for deep research",
            input_cost_per_million: 1.1,
            output_cost_per_million: 4.4,
        },
        ModelCatalogEntry {
            label_name: "claude-sonnet",
            reasoning: true,
            websearch: false,
            deep_research: false,
            description: "Strong long-context answers with visible thinking",
            input_cost_per_million: 3.0,
            output_cost_per_million: 15.0,
        },
        ModelCatalogEntry {
            label_name: "claude-haiku",
            reasoning: false,
            websearch: false,
            deep_research: false,
            description: "Lightweight summarization and routing",
            input_cost_per_million: 0.8,
            output_cost_per_million: 4.0,
        },
    ]
}

/// The model every deep-research request is pinned to, regardless of the
/// client's selection.
pub fn deep_research_model() -> LLMType {
    LLMType::O3Mini
}

pub fn completion_cost(llm_type: &LLMType, usage: &LLMClientUsage) -> f64 {
    let entry = model_catalog()
        .into_iter()
        .find(|entry| &entry.llm_type() == llm_type);
    match entry {
        Some(entry) => {
            usage.input_tokens as f64 / 1_000_000.0 * entry.input_cost_per_million
                + usage.output_tokens as f64 / 1_000_000.0 * entry.output_cost_per_million
        }
        None => 0.0,
    }
}

impl SelectedModelConfig {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    fn capability(&self, name: &str) -> bool {
        match &self.capabilities {
            Some(Capabilities::List(entries)) => entries.iter().any(|entry| entry == name),
            Some(Capabilities::Flags {
                reasoning,
                websearch,
                deep_research,
            }) => match name {
                "reasoning" => *reasoning,
                "websearch" => *websearch,
                "deepResearch" => *deep_research,
                _ => false,
            },
            None => false,
        }
    }

    pub fn resolve(&self) -> crate::agent::types::ResolvedModelConfig {
        let deep_research = self.deep_research || self.capability("deepResearch");
        let reasoning = self.reasoning || self.capability("reasoning") || deep_research;
        let websearch = self.websearch || self.capability("websearch");
        let (llm_type, label) = if deep_research {
            (deep_research_model(), "o3-mini".to_owned())
        } else {
            let label = self.model.clone().unwrap_or_else(|| "gpt-4o".to_owned());
            (llm_type_for_label(&label), label)
        };
        crate::agent::types::ResolvedModelConfig {
            llm_type,
            label,
            reasoning,
            websearch,
            deep_research,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_as_list() {
        let config = SelectedModelConfig::parse(
            r#"{"model": "gpt-4o", "capabilities": ["reasoning", "websearch"]}"#,
        )
        .expect("config to parse");
        let resolved = config.resolve();
        assert!(resolved.reasoning);
        assert!(resolved.websearch);
        assert!(!resolved.deep_research);
        assert_eq!(resolved.llm_type, LLMType::Gpt4o);
    }

    #[test]
    fn test_capabilities_as_flags() {
        let config = SelectedModelConfig::parse(
            r#"{"model": "claude-sonnet", "capabilities": {"reasoning": true}}"#,
        )
        .expect("config to parse");
        assert!(config.resolve().reasoning);
    }

    #[test]
    fn test_deep_research_forces_reasoning_model() {
        let config = SelectedModelConfig::parse(
            r#"{"model": "claude-haiku", "deepResearch": true}"#,
        )
        .expect("config to parse");
        let resolved = config.resolve();
        assert_eq!(resolved.llm_type, deep_research_model());
        assert!(resolved.reasoning);
        assert!(resolved.deep_research);
    }

    #[test]
    fn test_unknown_model_becomes_custom() {
        let config =
            SelectedModelConfig::parse(r#"{"model": "mistral-large"}"#).expect("config to parse");
        assert_eq!(
            config.resolve().llm_type,
            LLMType::Custom("mistral-large".to_owned())
        );
    }

    #[test]
    fn test_completion_cost_uses_catalog_pricing() {
        let usage = LLMClientUsage::new(1_000_000, 1_000_000);
        let cost = completion_cost(&LLMType::Gpt4o, &usage);
        assert!((cost - 12.5).abs() < f64::EPSILON);
        assert_eq!(
            completion_cost(&LLMType::Custom("unknown".to_owned()), &usage),
            0.0
        );
    }
}
