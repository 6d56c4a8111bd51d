//! Provider configuration from the environment.
//!
//! Azure OpenAI is used when `AZURE_OPENAI_ENDPOINT` is set, otherwise a
//! plain OpenAI-compatible endpoint is configured from `OPENAI_*` variables.

use std::env;

use thiserror::Error;
use toolchat_openai_model::{OpenAIConfig, OpenAIConfigBuilder};

/// Errors while reading provider configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("environment variable `{0}` is not set")]
    Missing(&'static str),
}

/// Reads the provider configuration from the process environment.
pub fn provider_config_from_env() -> Result<OpenAIConfig, ConfigError> {
    provider_config(|key| env::var(key).ok())
}

/// Reads the provider configuration through `lookup`.
///
/// Empty values count as unset.
pub fn provider_config<F>(lookup: F) -> Result<OpenAIConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
    let required = |key: &'static str| var(key).ok_or(ConfigError::Missing(key));

    if let Some(endpoint) = var("AZURE_OPENAI_ENDPOINT") {
        let api_key = required("AZURE_OPENAI_API_KEY")?;
        let api_version = required("AZURE_OPENAI_API_VERSION")?;
        let deployment = var("AZURE_OPENAI_DEPLOYMENT")
            .unwrap_or_else(|| "gpt-4o".to_owned());
        debug!("using Azure OpenAI deployment `{deployment}`");
        return Ok(OpenAIConfigBuilder::with_api_key(api_key)
            .with_azure(endpoint, deployment, api_version)
            .build());
    }

    let mut builder = OpenAIConfigBuilder::with_api_key(required("OPENAI_API_KEY")?);
    if let Some(base_url) = var("OPENAI_BASE_URL") {
        builder = builder.with_base_url(base_url);
    }
    if let Some(model) = var("OPENAI_MODEL") {
        builder = builder.with_model(model);
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup<'a>(
        pairs: &'a [(&'a str, &'a str)],
    ) -> impl Fn(&str) -> Option<String> + 'a {
        let vars: HashMap<_, _> = pairs.iter().copied().collect();
        move |key: &str| vars.get(key).map(|value| value.to_string())
    }

    #[test]
    fn test_azure() {
        let config = provider_config(lookup(&[
            ("AZURE_OPENAI_ENDPOINT", "https://res.openai.azure.com"),
            ("AZURE_OPENAI_API_KEY", "secret"),
            ("AZURE_OPENAI_API_VERSION", "2024-10-21"),
            ("OPENAI_API_KEY", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.model(), "gpt-4o");
        assert!(config.completions_url().starts_with(
            "https://res.openai.azure.com/openai/deployments/gpt-4o/"
        ));
        assert!(config.completions_url().contains("api-version=2024-10-21"));
    }

    #[test]
    fn test_azure_missing_key() {
        let err = provider_config(lookup(&[
            ("AZURE_OPENAI_ENDPOINT", "https://res.openai.azure.com"),
            ("AZURE_OPENAI_API_VERSION", "2024-10-21"),
        ]))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "environment variable `AZURE_OPENAI_API_KEY` is not set"
        );
    }

    #[test]
    fn test_openai() {
        let config = provider_config(lookup(&[
            ("OPENAI_API_KEY", "secret"),
            ("OPENAI_BASE_URL", "http://localhost:8080/v1"),
            ("OPENAI_MODEL", "local-model"),
        ]))
        .unwrap();
        assert_eq!(config.model(), "local-model");
        assert_eq!(
            config.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_nothing_set() {
        let err = provider_config(lookup(&[("OPENAI_API_KEY", " ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("OPENAI_API_KEY")));
    }
}
