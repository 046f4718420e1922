//! Transport lanes.
//!
//! This module defines two structs, [`Lane`] and [`LaneBuilder`].
//! A `Lane` executes operations over one HTTP client with a fixed network
//! binding: local address, proxy and timeouts. `LaneBuilder` exposes the
//! configuration and can also be read from a config file.
#![allow(clippy::module_name_repetitions)]

use std::net::IpAddr;
use std::time::Duration;

use log::{debug, error};
use serde::Deserialize;
use tokio::runtime::Handle;
use typed_builder::TypedBuilder;

use crate::{
    DeferredResult, ErrorKind, Operation, Reply, RequestSpec, Requester, Result, TransportHandle,
};

/// Default number of redirects followed before a request is deemed as failed, 5.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;
/// Default user agent, `netpace-<PKG_VERSION>`.
pub const DEFAULT_USER_AGENT: &str = concat!("netpace/", env!("CARGO_PKG_VERSION"));

/// Builder for [`Lane`].
///
/// Every timeout is optional; when unset, the default of the underlying
/// HTTP client applies.
#[derive(TypedBuilder, Deserialize, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
#[serde(default, deny_unknown_fields)]
pub struct LaneBuilder {
    /// Local address all connections of this lane are bound to.
    local_ip: Option<IpAddr>,
    /// Host of an HTTP proxy. Only used together with
    /// [`LaneBuilder::proxy_port`].
    proxy_host: Option<String>,
    /// Port of an HTTP proxy.
    proxy_port: Option<u16>,
    /// Timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    connect_timeout: Option<Duration>,
    /// Timeout for a whole request, from connecting until the body was read.
    #[serde(with = "humantime_serde")]
    request_timeout: Option<Duration>,
    /// Timeout between two successful reads.
    #[serde(with = "humantime_serde")]
    read_timeout: Option<Duration>,
    /// Whether redirects are followed.
    #[builder(default = true)]
    follow_redirects: bool,
    /// Maximum number of redirects per request.
    #[builder(default = DEFAULT_MAX_REDIRECTS)]
    max_redirects: usize,
    /// When `true`, accept invalid TLS certificates.
    ///
    /// ## Warning
    ///
    /// Any certificate for any site will be trusted, including expired ones.
    /// Only use this for endpoints you control.
    accept_invalid_certs: bool,
    /// User-agent sent with every request.
    #[builder(default_code = "String::from(DEFAULT_USER_AGENT)")]
    user_agent: String,
    /// Runtime on which completion callbacks run, unless an operation
    /// brings its own.
    #[serde(skip)]
    context: Option<Handle>,
}

impl Default for LaneBuilder {
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl LaneBuilder {
    /// Set the runtime on which completion callbacks run
    #[must_use]
    pub fn with_context(mut self, context: Handle) -> Self {
        self.context = Some(context);
        self
    }

    /// Set the local address, e.g. when one lane is built per configured IP
    #[must_use]
    pub const fn with_local_ip(mut self, local_ip: Option<IpAddr>) -> Self {
        self.local_ip = local_ip;
        self
    }

    /// Instantiates a [`Lane`].
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the proxy address is invalid or the request
    /// client cannot be created.
    pub fn lane(self) -> Result<Lane> {
        let build_error = |e: reqwest::Error| ErrorKind::BuildRequestClient(e.into());

        let redirect_policy = if self.follow_redirects {
            reqwest::redirect::Policy::limited(self.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };

        let mut builder = reqwest::ClientBuilder::new()
            .gzip(true)
            .user_agent(self.user_agent)
            .local_address(self.local_ip)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .redirect(redirect_policy);

        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = self.read_timeout {
            builder = builder.read_timeout(timeout);
        }

        match (self.proxy_host.as_deref(), self.proxy_port) {
            (Some(host), Some(port)) if !host.is_empty() => {
                let proxy = reqwest::Proxy::all(format!("http://{host}:{port}"))
                    .map_err(build_error)?;
                builder = builder.proxy(proxy);
            }
            _ => {}
        }

        Ok(Lane {
            client: builder.build().map_err(build_error)?,
            local_ip: self.local_ip,
            context: self.context,
        })
    }
}

/// Executes operations through one HTTP client with a fixed network binding.
///
/// Every call to [`Requester::request`] starts exactly one request. There is
/// no queueing and no retry inside a lane; see
/// [`ThrottledDispatcher`](crate::ThrottledDispatcher) for pacing and
/// [`RepeatScheduler`](crate::RepeatScheduler) for repetition.
///
/// See [`LaneBuilder`] which contains sane defaults for all configuration
/// options.
#[derive(Debug, Clone)]
pub struct Lane {
    /// Underlying `reqwest` client instance that handles the HTTP requests.
    client: reqwest::Client,
    /// Local address the client is bound to.
    local_ip: Option<IpAddr>,
    /// Default runtime for completion callbacks.
    context: Option<Handle>,
}

impl Lane {
    /// The local address this lane is bound to, if any
    #[must_use]
    pub const fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    async fn execute(client: reqwest::Client, spec: RequestSpec) -> Result<Reply> {
        let RequestSpec {
            method,
            url,
            headers,
            body,
        } = spec;

        let mut request = client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ErrorKind::NetworkRequest(e.into()))?;
        Reply::from_response(response).await
    }
}

impl Requester for Lane {
    /// Start the operation and return a result already bound to it.
    ///
    /// The completion callback runs on the operation's context, else on the
    /// lane's context, else inline on the task observing the completion.
    /// Returns `None` if the request descriptor cannot be produced.
    fn request(&self, operation: Operation) -> Option<DeferredResult> {
        let spec = match operation.resolve() {
            Ok(spec) => spec,
            Err(e) => {
                error!("Cannot build request for {operation:?}: {e}");
                return None;
            }
        };
        debug!("{} {} via {:?}", spec.method, spec.url, self.local_ip);

        let handle = TransportHandle::spawn(Self::execute(self.client.clone(), spec));

        let listener = handle.clone();
        let fallback = self.context.clone();
        tokio::spawn(async move {
            let outcome = listener.outcome().await;
            operation.deliver(outcome, fallback.as_ref());
        });

        Some(DeferredResult::bound(handle))
    }
}
