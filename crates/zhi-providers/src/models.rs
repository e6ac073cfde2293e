//! Catalog of GLM models known to zhi.
//!
//! Unknown model names are still sent to the API as-is; the catalog only
//! decides optional request features such as thinking.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelTier {
    Premium,
    Economy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: &'static str,
    pub tier: ModelTier,
    pub supports_thinking: bool,
    pub supports_tools: bool,
}

pub static MODELS: &[ModelInfo] = &[
    ModelInfo {
        name: "glm-5",
        tier: ModelTier::Premium,
        supports_thinking: true,
        supports_tools: true,
    },
    ModelInfo {
        name: "glm-4-flash",
        tier: ModelTier::Economy,
        supports_thinking: false,
        supports_tools: true,
    },
    ModelInfo {
        name: "glm-4-air",
        tier: ModelTier::Economy,
        supports_thinking: false,
        supports_tools: true,
    },
];

pub fn get_model(name: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.name == name)
}

pub fn is_valid_model(name: &str) -> bool {
    get_model(name).is_some()
}

pub fn list_models() -> &'static [ModelInfo] {
    MODELS
}

/// Whether requests for `name` may carry the thinking flag.
pub fn supports_thinking(name: &str) -> bool {
    get_model(name).is_some_and(|m| m.supports_thinking)
}
