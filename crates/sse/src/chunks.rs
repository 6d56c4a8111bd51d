use std::collections::VecDeque;
use std::fmt::{self, Display};

use bytes::Bytes;
use reqwest::Response;

/// Reading the next chunk failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error(String);

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to read body chunk: {}", self.0)
    }
}

impl std::error::Error for Error {}

/// An adapter for streaming byte chunks.
pub enum Chunks {
    /// Chunks of a live HTTP response body.
    Response(Response),
    /// Preloaded chunks, mostly for tests.
    VecDeque(VecDeque<Bytes>),
}

impl Chunks {
    /// Streams the body of `response`.
    #[inline]
    pub fn from_response(response: Response) -> Self {
        Chunks::Response(response)
    }

    /// Yields the given chunks in order.
    #[inline]
    pub fn from_vec_deque(vec: VecDeque<Bytes>) -> Self {
        Chunks::VecDeque(vec)
    }

    /// Returns the next chunk, or `None` when the body has ended.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match self {
            Chunks::Response(response) => response.chunk().await.map_err(|err| {
                trace!("body chunk error: {err}");
                Error(err.to_string())
            }),
            Chunks::VecDeque(vec) => Ok(vec.pop_front()),
        }
    }
}
