//! MCP Prompt Templates
//!
//! Canned prompts that walk an assistant through common Cloud Run tasks.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

/// A prompt argument definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// A prompt template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// A prompt message (the actual content).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: PromptContent,
}

/// Prompt content types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PromptContent {
    Text { text: String },
}

/// Result of prompts/list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResult {
    pub prompts: Vec<Prompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Result of prompts/get.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPromptResult {
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

/// Template text plus the wording used for optional arguments left blank.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub template: String,
    pub fallbacks: HashMap<String, String>,
}

/// Prompt registry.
#[derive(Debug, Clone, Default)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, (Prompt, PromptTemplate)>,
}

impl PromptRegistry {
    /// Create a new registry with the built-in prompts.
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register_builtin_prompts();
        registry
    }

    fn register_builtin_prompts(&mut self) {
        self.register(
            Prompt {
                name: "deploy".to_string(),
                description: "Deploy a container image to Cloud Run".to_string(),
                arguments: vec![
                    PromptArgument {
                        name: "name".to_string(),
                        description: "Name of the Cloud Run service".to_string(),
                        required: false,
                    },
                    PromptArgument {
                        name: "project".to_string(),
                        description: "Google Cloud project ID".to_string(),
                        required: false,
                    },
                    PromptArgument {
                        name: "region".to_string(),
                        description: "Region to deploy to".to_string(),
                        required: false,
                    },
                ],
            },
            PromptTemplate {
                template: "Use the deploy_container_image tool to deploy to Cloud Run.\n\
                           Service: {{name}}\n\
                           Project: {{project}}\n\
                           Region: {{region}}\n\
                           Once the deployment finishes, call get_service and report the service URL."
                    .to_string(),
                fallbacks: HashMap::from([
                    ("name".to_string(), "the default service name".to_string()),
                    ("project".to_string(), "the default project".to_string()),
                    ("region".to_string(), "the default region".to_string()),
                ]),
            },
        );

        self.register(
            Prompt {
                name: "logs".to_string(),
                description: "Inspect recent logs of a Cloud Run service".to_string(),
                arguments: vec![
                    PromptArgument {
                        name: "service".to_string(),
                        description: "Name of the Cloud Run service".to_string(),
                        required: false,
                    },
                    PromptArgument {
                        name: "project".to_string(),
                        description: "Google Cloud project ID".to_string(),
                        required: false,
                    },
                ],
            },
            PromptTemplate {
                template: "Use the get_service_log tool to fetch the latest logs of {{service}} in {{project}}.\n\
                           Summarise errors and warnings first, then anything unusual."
                    .to_string(),
                fallbacks: HashMap::from([
                    ("service".to_string(), "the default service".to_string()),
                    ("project".to_string(), "the default project".to_string()),
                ]),
            },
        );
    }

    /// Register a prompt.
    pub fn register(&mut self, prompt: Prompt, template: PromptTemplate) {
        self.prompts.insert(prompt.name.clone(), (prompt, template));
    }

    /// List all prompts.
    pub fn list(&self) -> Vec<Prompt> {
        self.prompts.values().map(|(p, _)| p.clone()).collect()
    }

    /// Number of registered prompts.
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    /// True when no prompt is registered.
    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn clear(&mut self) {
        self.prompts.clear();
    }

    /// Render a prompt by name with arguments substituted.
    pub fn get(&self, name: &str, arguments: &HashMap<String, String>) -> Result<GetPromptResult> {
        let (prompt, template) = self
            .prompts
            .get(name)
            .ok_or_else(|| Error::InvalidParams(format!("Prompt not found: {}", name)))?;

        let mut text = template.template.clone();
        for arg in &prompt.arguments {
            let value = match arguments.get(&arg.name).filter(|v| !v.is_empty()) {
                Some(value) => value.clone(),
                None if arg.required => {
                    return Err(Error::InvalidParams(format!(
                        "Missing required argument: {}",
                        arg.name
                    )))
                }
                None => template.fallbacks.get(&arg.name).cloned().unwrap_or_default(),
            };
            text = text.replace(&format!("{{{{{}}}}}", arg.name), &value);
        }

        Ok(GetPromptResult {
            description: Some(prompt.description.clone()),
            messages: vec![PromptMessage {
                role: "user".to_string(),
                content: PromptContent::Text { text },
            }],
        })
    }
}
