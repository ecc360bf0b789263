//! Built-in presets for well-known LLM providers.
//!
//! A provider entry in the config whose name matches a preset may omit
//! `base_url`, `dialect` and `api_key_env`; the preset fills them in.
//! Base URLs stop short of the API path because the codec appends
//! `/v1/chat/completions`, `/responses` or `/v1/messages` itself.

use crate::codec::Dialect;

#[derive(Debug, Clone, Copy)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub dialect: Dialect,
    pub default_api_key_env: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com",
        dialect: Dialect::OpenAi,
        default_api_key_env: "OPENAI_API_KEY",
    },
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api",
        dialect: Dialect::OpenAi,
        default_api_key_env: "OPENROUTER_API_KEY",
    },
    ProviderPreset {
        name: "groq",
        base_url: "https://api.groq.com/openai",
        dialect: Dialect::OpenAi,
        default_api_key_env: "GROQ_API_KEY",
    },
    ProviderPreset {
        name: "together",
        base_url: "https://api.together.xyz",
        dialect: Dialect::OpenAi,
        default_api_key_env: "TOGETHER_API_KEY",
    },
    ProviderPreset {
        name: "fireworks",
        base_url: "https://api.fireworks.ai/inference",
        dialect: Dialect::OpenAi,
        default_api_key_env: "FIREWORKS_API_KEY",
    },
    ProviderPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com",
        dialect: Dialect::OpenAi,
        default_api_key_env: "DEEPSEEK_API_KEY",
    },
    ProviderPreset {
        name: "mistral",
        base_url: "https://api.mistral.ai",
        dialect: Dialect::OpenAi,
        default_api_key_env: "MISTRAL_API_KEY",
    },
    ProviderPreset {
        name: "anthropic",
        base_url: "https://api.anthropic.com",
        dialect: Dialect::Anthropic,
        default_api_key_env: "ANTHROPIC_API_KEY",
    },
];

impl ProviderPreset {
    /// Case-insensitive lookup by provider name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }

    #[must_use]
    pub fn names() -> Vec<&'static str> {
        PRESETS.iter().map(|p| p.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert!(ProviderPreset::from_name("openai").is_some());
        assert!(ProviderPreset::from_name("OpenRouter").is_some());
        assert!(ProviderPreset::from_name("openai-prod").is_none());
    }

    #[test]
    fn test_only_anthropic_uses_the_messages_dialect() {
        for preset in ProviderPreset::all() {
            let expected = if preset.name == "anthropic" {
                Dialect::Anthropic
            } else {
                Dialect::OpenAi
            };
            assert_eq!(preset.dialect, expected, "preset {}", preset.name);
        }
    }

    #[test]
    fn test_base_urls_have_no_api_path() {
        for preset in ProviderPreset::all() {
            assert!(!preset.base_url.ends_with('/'), "{}", preset.name);
            assert!(!preset.base_url.ends_with("/v1"), "{}", preset.name);
        }
    }
}
