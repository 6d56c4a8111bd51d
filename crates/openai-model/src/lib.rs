//! A model provider for OpenAI-compatible APIs, including Azure OpenAI
//! deployments.

#[macro_use]
extern crate tracing;

mod config;
mod proto;
mod response;

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use backoff::future::retry_notify;
use bytes::Bytes;
use mime::Mime;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use toolchat_model::{
    ErrorKind, ModelProvider, ModelProviderError, ModelRequest,
};
use toolchat_sse::{Chunks, Sse};

pub use config::{OpenAIConfig, OpenAIConfigBuilder};
use proto::ErrorBody;
use response::OpenAIResponse;

/// Error type for [`OpenAIProvider`].
#[derive(Debug)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    /// Returns the error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// OpenAI-compatible model provider.
///
/// Requests that fail before the response starts streaming, because the
/// connection failed or the server answered 429 or 5xx, are retried with
/// exponential backoff. Failures while streaming are returned as is.
#[derive(Clone, Debug)]
pub struct OpenAIProvider {
    client: Client,
    config: Arc<OpenAIConfig>,
}

impl OpenAIProvider {
    /// Creates a new `OpenAIProvider` with the given configuration.
    #[inline]
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            client: Client::new(),
            config: Arc::new(config),
        }
    }
}

impl ModelProvider for OpenAIProvider {
    type Error = Error;
    type Response = OpenAIResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let openai_req = proto::create_request(req, &self.config);
        let body = serde_json::to_vec(&openai_req).map(Bytes::from);
        let client = self.client.clone();
        let config = Arc::clone(&self.config);

        async move {
            let body = body.map_err(|err| {
                Error::new(format!("failed to encode request: {err}"), ErrorKind::Other)
            })?;
            let policy = ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(500))
                .with_max_interval(Duration::from_secs(8))
                .with_max_elapsed_time(None)
                .build();

            let mut attempt = 0;
            let resp = retry_notify(
                policy,
                || {
                    attempt += 1;
                    let attempt = attempt;
                    let max_retries = config.max_retries;
                    let request = build_request(&client, &config, body.clone());
                    async move {
                        send_once(request).await.map_err(|failure| {
                            if failure.retryable && attempt <= max_retries {
                                match failure.retry_after {
                                    Some(delay) => backoff::Error::retry_after(
                                        failure.error,
                                        delay,
                                    ),
                                    None => backoff::Error::transient(failure.error),
                                }
                            } else {
                                backoff::Error::permanent(failure.error)
                            }
                        })
                    }
                },
                |err: Error, delay: Duration| {
                    warn!("request failed ({err}), retrying in {delay:?}");
                },
            )
            .await?;

            // Here we got a successful response.
            let chunks = Chunks::from_response(resp);
            let sse = Sse::new(chunks);
            Ok(OpenAIResponse::from_sse(sse))
        }
    }
}

fn build_request(
    client: &Client,
    config: &OpenAIConfig,
    body: Bytes,
) -> RequestBuilder {
    let builder = client.post(config.completions_url());
    let builder = if config.is_azure() {
        builder.header("api-key", &config.api_key)
    } else {
        builder.header(
            header::AUTHORIZATION,
            format!("Bearer {}", config.api_key),
        )
    };
    builder
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "text/event-stream")
        .body(body)
}

struct Failure {
    error: Error,
    retryable: bool,
    retry_after: Option<Duration>,
}

async fn send_once(request: RequestBuilder) -> Result<Response, Failure> {
    let resp = request.send().await.map_err(|err| Failure {
        retryable: err.is_connect() || err.is_timeout(),
        error: Error::new(format!("{err}"), ErrorKind::Transport),
        retry_after: None,
    })?;

    let status = resp.status();
    if !status.is_success() {
        let retry_after = resp
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = resp.text().await.unwrap_or_default();
        return Err(Failure {
            error: status_error(status, &text),
            retryable: status == StatusCode::TOO_MANY_REQUESTS
                || status.is_server_error(),
            retry_after,
        });
    }

    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let is_event_stream = content_type
        .and_then(|v| v.parse().ok())
        .map(|m: Mime| m.subtype().as_str() == "event-stream")
        .unwrap_or(false);
    if !is_event_stream {
        return Err(Failure {
            error: Error::new(
                format!("unexpected content type: {content_type:?}"),
                ErrorKind::InvalidResponse,
            ),
            retryable: false,
            retry_after: None,
        });
    }
    Ok(resp)
}

fn status_error(status: StatusCode, body: &str) -> Error {
    let detail = serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error);
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimitExceeded,
        _ if detail
            .as_ref()
            .and_then(|d| d.code.as_deref())
            .is_some_and(|code| code == "content_filter") =>
        {
            ErrorKind::Moderated
        }
        _ if status.is_server_error() => ErrorKind::Transport,
        _ => ErrorKind::Other,
    };
    let message = match detail {
        Some(detail) if !detail.message.is_empty() => {
            format!("{status}: {}", detail.message)
        }
        _ => format!("{status}: {body}"),
    };
    Error::new(message, kind)
}
