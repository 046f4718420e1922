use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use url::Url;

use crate::{ErrorKind, Result};

/// The completed response of an operation.
///
/// Unlike [`reqwest::Response`] this is [`Clone`], so that one reply can be
/// handed to the completion callback and to every waiter of the matching
/// [`DeferredResult`](crate::DeferredResult).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// HTTP status of the response
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Final URL, after redirects
    pub url: Url,
    /// Raw response body
    pub body: Bytes,
}

impl Reply {
    /// Create a reply with empty headers
    #[must_use]
    pub fn new(status: StatusCode, url: Url, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            url,
            body: body.into(),
        }
    }

    pub(crate) async fn from_response(response: reqwest::Response) -> Result<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ErrorKind::ReadResponseBody(e.into()))?;

        Ok(Self {
            status,
            headers,
            url,
            body,
        })
    }

    /// The body as text, replacing invalid UTF-8 sequences
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
