use std::fmt::Debug;

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) enum Flavor {
    OpenAI {
        base_url: String,
    },
    Azure {
        endpoint: String,
        deployment: String,
        api_version: String,
    },
}

/// Builder for [`OpenAIConfig`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OpenAIConfigBuilder {
    api_key: String,
    model: Option<String>,
    base_url: Option<String>,
    azure: Option<(String, String, String)>,
    max_tokens: Option<u32>,
    max_retries: Option<u32>,
}

impl OpenAIConfigBuilder {
    /// Creates a builder with the given API key.
    #[inline]
    pub fn with_api_key<S: Into<String>>(api_key: S) -> Self {
        Self {
            api_key: api_key.into(),
            model: None,
            base_url: None,
            azure: None,
            max_tokens: None,
            max_retries: None,
        }
    }

    /// Sets the model to use.
    #[inline]
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets a custom base URL.
    #[inline]
    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Targets an Azure OpenAI deployment instead of a plain base URL.
    ///
    /// The deployment name is also sent as the model name.
    #[inline]
    pub fn with_azure<E, D, V>(
        mut self,
        endpoint: E,
        deployment: D,
        api_version: V,
    ) -> Self
    where
        E: Into<String>,
        D: Into<String>,
        V: Into<String>,
    {
        self.azure =
            Some((endpoint.into(), deployment.into(), api_version.into()));
        self
    }

    /// Sets the completion token limit, 4096 by default.
    #[inline]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets how many times a failed request is retried, 3 by default.
    #[inline]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> OpenAIConfig {
        let (model, flavor) = match self.azure {
            Some((endpoint, deployment, api_version)) => (
                self.model.unwrap_or_else(|| deployment.clone()),
                Flavor::Azure {
                    endpoint: endpoint.trim_end_matches('/').to_owned(),
                    deployment,
                    api_version,
                },
            ),
            None => (
                self.model.unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
                Flavor::OpenAI {
                    base_url: self
                        .base_url
                        .as_deref()
                        .unwrap_or(DEFAULT_BASE_URL)
                        .trim_end_matches('/')
                        .to_owned(),
                },
            ),
        };
        OpenAIConfig {
            api_key: self.api_key,
            model,
            flavor,
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        }
    }
}

impl Debug for OpenAIConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIConfigBuilder")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("azure", &self.azure)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Configuration for the OpenAI-compatible provider.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OpenAIConfig {
    pub(crate) api_key: String,
    pub(crate) model: String,
    pub(crate) flavor: Flavor,
    pub(crate) max_tokens: u32,
    pub(crate) max_retries: u32,
}

impl OpenAIConfig {
    /// Returns the URL completions are posted to.
    pub fn completions_url(&self) -> String {
        match &self.flavor {
            Flavor::OpenAI { base_url } => format!("{base_url}/chat/completions"),
            Flavor::Azure {
                endpoint,
                deployment,
                api_version,
            } => format!(
                "{endpoint}/openai/deployments/{deployment}/chat/completions?api-version={api_version}"
            ),
        }
    }

    /// Returns the model name sent with every request.
    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    pub(crate) fn is_azure(&self) -> bool {
        matches!(self.flavor, Flavor::Azure { .. })
    }
}

impl Debug for OpenAIConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("url", &self.completions_url())
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_url() {
        let config = OpenAIConfigBuilder::with_api_key("sk")
            .with_base_url("http://localhost:8080/v1/")
            .build();
        assert_eq!(
            config.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(config.model(), DEFAULT_MODEL);
        assert_eq!(config.max_tokens, 4096);
    }

    #[test]
    fn test_azure_url() {
        let config = OpenAIConfigBuilder::with_api_key("key")
            .with_azure("https://res.openai.azure.com/", "gpt4o", "2024-06-01")
            .build();
        assert_eq!(
            config.completions_url(),
            "https://res.openai.azure.com/openai/deployments/gpt4o/chat/completions?api-version=2024-06-01"
        );
        assert_eq!(config.model(), "gpt4o");
        assert!(config.is_azure());
    }

    #[test]
    fn test_debug_hides_key() {
        let config = OpenAIConfigBuilder::with_api_key("secret").build();
        assert!(!format!("{config:?}").contains("secret"));
    }
}
