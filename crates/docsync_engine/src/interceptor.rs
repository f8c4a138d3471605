//! Request and response interceptors.
//!
//! Interceptors see every call a [`CouchClient`](crate::CouchClient) makes,
//! feed pages included. Session authentication and call instrumentation
//! are layered in here instead of in the protocol code.

use crate::error::ReplicationResult;
use crate::http::{HttpRequest, HttpResponse};
use std::fmt;
use std::sync::Arc;

/// Transforms an outbound request.
pub trait RequestInterceptor: Send + Sync {
    /// Returns the request to send. An error aborts the call.
    fn on_request(&self, request: HttpRequest) -> ReplicationResult<HttpRequest>;
}

/// Transforms an inbound response.
pub trait ResponseInterceptor: Send + Sync {
    /// Returns the response handed back to the caller.
    ///
    /// Setting [`HttpResponse::replay`] asks the client to issue the
    /// request again.
    fn on_response(&self, response: HttpResponse) -> ReplicationResult<HttpResponse>;
}

/// Ordered request and response interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    request: Vec<Arc<dyn RequestInterceptor>>,
    response: Vec<Arc<dyn ResponseInterceptor>>,
}

impl InterceptorChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request interceptor.
    pub fn push_request(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
        self.request.push(interceptor);
    }

    /// Appends a response interceptor.
    pub fn push_response(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
        self.response.push(interceptor);
    }

    /// Runs every request interceptor in registration order.
    pub fn apply_request(&self, request: HttpRequest) -> ReplicationResult<HttpRequest> {
        self.request
            .iter()
            .try_fold(request, |request, interceptor| interceptor.on_request(request))
    }

    /// Runs every response interceptor in registration order.
    pub fn apply_response(&self, response: HttpResponse) -> ReplicationResult<HttpResponse> {
        self.response
            .iter()
            .try_fold(response, |response, interceptor| {
                interceptor.on_response(response)
            })
    }

    /// Number of request interceptors.
    pub fn request_len(&self) -> usize {
        self.request.len()
    }

    /// Number of response interceptors.
    pub fn response_len(&self) -> usize {
        self.response.len()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .finish()
    }
}
