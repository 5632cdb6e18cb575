//! Model family descriptors and launch-request resolution.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{OrchestratorError, Result};
use crate::prompt::PromptStyle;

lazy_static! {
    pub static ref MODEL_NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap();
}

/// What a launched model can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelAbility {
    Generate,
    Chat,
    Embed,
}

impl ModelAbility {
    pub fn name(&self) -> &'static str {
        match self {
            ModelAbility::Generate => "generate",
            ModelAbility::Chat => "chat",
            ModelAbility::Embed => "embed",
        }
    }
}

/// On-disk packaging of a model's weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Ggmlv3,
    Gguf,
    Pytorch,
}

impl ModelFormat {
    pub fn name(&self) -> &str {
        match self {
            ModelFormat::Ggmlv3 => "ggmlv3",
            ModelFormat::Gguf => "gguf",
            ModelFormat::Pytorch => "pytorch",
        }
    }

    /// Formats servable by llama.cpp's `llama-server`.
    pub fn is_llama_cpp(&self) -> bool {
        matches!(self, ModelFormat::Ggmlv3 | ModelFormat::Gguf)
    }
}

impl std::str::FromStr for ModelFormat {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ggmlv3" => Ok(ModelFormat::Ggmlv3),
            "gguf" => Ok(ModelFormat::Gguf),
            "pytorch" => Ok(ModelFormat::Pytorch),
            other => Err(OrchestratorError::InvalidSpec(format!(
                "unknown model format `{}`",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ModelSpecVariant {
    pub model_format: ModelFormat,
    #[validate(range(min = 1))]
    pub model_size_in_billions: u32,
    #[validate(length(min = 1))]
    pub quantizations: Vec<String>,
    #[validate(length(min = 1))]
    pub model_id: String,
}

/// A launchable model family: either shipped with the catalog or registered by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ModelFamily {
    pub version: u32,
    #[validate(regex = "MODEL_NAME_RE")]
    pub model_name: String,
    #[validate(length(min = 1))]
    pub model_lang: Vec<String>,
    #[validate(length(min = 1))]
    pub model_ability: Vec<ModelAbility>,
    #[validate(length(min = 1))]
    pub model_specs: Vec<ModelSpecVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_style: Option<PromptStyle>,
}

impl ModelFamily {
    /// Parse and validate a registration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let family: ModelFamily = serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::InvalidSpec(format!("malformed model description: {}", e)))?;
        family.check()?;
        Ok(family)
    }

    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| OrchestratorError::InvalidSpec(format!("model `{}`: {}", self.model_name, e)))?;
        for spec in &self.model_specs {
            spec.validate().map_err(|e| {
                OrchestratorError::InvalidSpec(format!("model `{}` spec: {}", self.model_name, e))
            })?;
        }

        if self.has_ability(ModelAbility::Chat) {
            match &self.prompt_style {
                Some(style) => style.validate()?,
                None => {
                    return Err(OrchestratorError::InvalidSpec(format!(
                        "model `{}` declares the chat ability but has no prompt_style",
                        self.model_name
                    )))
                }
            }
        } else if let Some(style) = &self.prompt_style {
            style.validate()?;
        }
        Ok(())
    }

    pub fn has_ability(&self, ability: ModelAbility) -> bool {
        self.model_ability.contains(&ability)
    }

    /// Pick the spec variant and quantization a launch request refers to.
    ///
    /// Omitted request fields match anything; the first matching variant wins
    /// and its first quantization is the default.
    pub fn resolve(&self, request: &LaunchRequest) -> Result<ResolvedModel> {
        for spec in &self.model_specs {
            if request.model_format.is_some_and(|f| f != spec.model_format) {
                continue;
            }
            if request
                .model_size_in_billions
                .is_some_and(|s| s != spec.model_size_in_billions)
            {
                continue;
            }
            let quantization = match &request.quantization {
                Some(q) if spec.quantizations.contains(q) => q.clone(),
                Some(_) => continue,
                None => spec.quantizations[0].clone(),
            };
            return Ok(ResolvedModel {
                family: self.clone(),
                spec: spec.clone(),
                quantization,
            });
        }

        Err(OrchestratorError::InvalidSpec(format!(
            "no spec of model `{}` matches format={}, size={}, quantization={}",
            self.model_name,
            request.model_format.map(|f| f.to_string()).unwrap_or_else(|| "*".into()),
            request
                .model_size_in_billions
                .map(|s| s.to_string())
                .unwrap_or_else(|| "*".into()),
            request.quantization.as_deref().unwrap_or("*"),
        )))
    }
}

/// Immutable launch request, as accepted by `Orchestrator::launch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_uid: Option<String>,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_size_in_billions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_format: Option<ModelFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
}

impl LaunchRequest {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_uid: None,
            model_name: model_name.into(),
            model_size_in_billions: None,
            model_format: None,
            quantization: None,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.model_uid = Some(uid.into());
        self
    }

    pub fn with_size(mut self, size_in_billions: u32) -> Self {
        self.model_size_in_billions = Some(size_in_billions);
        self
    }

    pub fn with_format(mut self, format: ModelFormat) -> Self {
        self.model_format = Some(format);
        self
    }

    pub fn with_quantization(mut self, quantization: impl Into<String>) -> Self {
        self.quantization = Some(quantization.into());
        self
    }
}

/// A launch request bound to one concrete spec variant.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub family: ModelFamily,
    pub spec: ModelSpecVariant,
    pub quantization: String,
}
