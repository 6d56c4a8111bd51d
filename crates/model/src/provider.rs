use std::error::Error;

use crate::error::ErrorKind;
use crate::request::ModelRequest;
use crate::response::ModelResponse;

/// The error type for a model provider.
pub trait ModelProviderError: Error + Send + Sync + 'static {
    /// Returns the kind of this error.
    fn kind(&self) -> ErrorKind;
}

/// A completion endpoint.
///
/// A provider is created once and shared by every turn of a conversation,
/// so it must behave like a stateless object: each call to
/// [`send_request`](Self::send_request) depends only on the request passed
/// in. Connection pools and credentials are fine to keep inside.
pub trait ModelProvider: Send + Sync {
    /// The error type that may be returned by the provider.
    type Error: ModelProviderError;

    /// The response type for this provider.
    type Response: ModelResponse<Error = Self::Error>;

    /// Sends a request to the model.
    ///
    /// The returned future must not borrow `self` or `req`, so it can be
    /// moved into a task or raced against a timeout.
    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static;
}
