use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::HeaderMap;
use reqwest::Method;
use tokio::runtime::Handle;
use url::Url;

use crate::{ErrorKind, Reply, Result};

/// Completion callback of an [`Operation`].
///
/// Receives the reply on success or the error that ended the operation,
/// including overflow rejections and cancellation.
pub type Callback = Arc<dyn Fn(Result<Reply>) + Send + Sync>;

/// Produces a [`RequestSpec`] lazily, right before the operation is executed.
pub type RequestSupplier = Arc<dyn Fn() -> Result<RequestSpec> + Send + Sync>;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Describes a single outbound HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    /// HTTP method, `GET` by default
    pub method: Method,
    /// Target URL
    pub url: Url,
    /// Extra headers sent with the request
    pub headers: HeaderMap,
    /// Optional request body
    pub body: Option<Bytes>,
}

impl RequestSpec {
    /// Create a `GET` request for the given URL
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a `POST` request with the given body
    #[must_use]
    pub fn post(url: Url, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: Some(body.into()),
        }
    }
}

impl TryFrom<&str> for RequestSpec {
    type Error = ErrorKind;

    fn try_from(url: &str) -> Result<Self> {
        Ok(Self::get(Url::parse(url)?))
    }
}

#[derive(Clone)]
enum Source {
    Ready(RequestSpec),
    Supplier(RequestSupplier),
}

/// A unit of work for a [`Lane`](crate::Lane) or any other
/// [`Requester`](crate::Requester).
///
/// An operation is either a ready-made [`RequestSpec`] or a supplier which
/// builds one at execution time. Cloning is cheap and a clone is the *same*
/// operation: equality is based on identity, which is what the
/// [`RepeatScheduler`](crate::RepeatScheduler) uses to remove tasks.
#[derive(Clone)]
pub struct Operation {
    id: u64,
    source: Source,
    callback: Option<Callback>,
    context: Option<Handle>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl Operation {
    /// Create an operation from a ready-made request descriptor
    #[must_use]
    pub fn new(spec: RequestSpec) -> Self {
        Self::with_source(Source::Ready(spec))
    }

    /// Create an operation whose request descriptor is produced lazily.
    ///
    /// The supplier runs every time the operation is executed, which makes
    /// it possible to refresh signatures or timestamps on repeated requests.
    #[must_use]
    pub fn from_supplier<F>(supplier: F) -> Self
    where
        F: Fn() -> Result<RequestSpec> + Send + Sync + 'static,
    {
        Self::with_source(Source::Supplier(Arc::new(supplier)))
    }

    /// Create a `GET` operation for the given URL
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(RequestSpec::get(url))
    }

    fn with_source(source: Source) -> Self {
        Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            source,
            callback: None,
            context: None,
            payload: None,
        }
    }

    /// Set the completion callback
    #[must_use]
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Result<Reply>) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Run the completion callback on the given runtime instead of the
    /// default context of the executing lane
    #[must_use]
    pub fn with_context(mut self, context: Handle) -> Self {
        self.context = Some(context);
        self
    }

    /// Attach an opaque value, retrievable with [`Operation::payload`]
    #[must_use]
    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Replace the completion callback
    pub fn set_callback(&mut self, callback: Callback) {
        self.callback = Some(callback);
    }

    /// Replace the callback-execution context
    pub fn set_context(&mut self, context: Option<Handle>) {
        self.context = context;
    }

    /// Unique identity of this operation, shared by all of its clones
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The callback-execution context, if one was set
    #[must_use]
    pub const fn context(&self) -> Option<&Handle> {
        self.context.as_ref()
    }

    /// The attached payload, if present and of type `T`
    #[must_use]
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_deref()?.downcast_ref()
    }

    /// Produce the request descriptor of this operation
    ///
    /// # Errors
    ///
    /// Returns the error of the supplier, if the descriptor is built lazily
    /// and the supplier fails.
    pub fn resolve(&self) -> Result<RequestSpec> {
        match &self.source {
            Source::Ready(spec) => Ok(spec.clone()),
            Source::Supplier(supplier) => supplier(),
        }
    }

    /// Hand an outcome to the completion callback.
    ///
    /// The callback runs on the operation's own context if it has one, on
    /// `fallback` otherwise, and inline on the calling task if neither is
    /// set.
    pub(crate) fn deliver(&self, outcome: Result<Reply>, fallback: Option<&Handle>) {
        let Some(callback) = self.callback.clone() else {
            return;
        };
        match self.context.as_ref().or(fallback) {
            Some(context) => {
                context.spawn(async move { callback(outcome) });
            }
            None => callback(outcome),
        }
    }
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Operation {}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Ready(spec) => format!("{} {}", spec.method, spec.url),
            Source::Supplier(_) => "<supplier>".to_string(),
        };
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("source", &source)
            .field("callback", &self.callback.is_some())
            .field("context", &self.context.is_some())
            .finish_non_exhaustive()
    }
}
