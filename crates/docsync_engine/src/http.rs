//! HTTP transport and the remote database client.
//!
//! The actual HTTP library is abstracted behind [`HttpClient`] so the
//! engine can run over any client (or, in tests, over an in-process
//! loopback server).

use crate::error::{ReplicationError, ReplicationResult};
use crate::interceptor::InterceptorChain;
use crate::store::DocumentStore;
use docsync_protocol::{
    BulkDocsRequest, BulkDocsResponse, BulkGetItem, BulkGetRequest, BulkGetResponse,
    ChangesRequest, ChangesResponse, DatabaseInfo, DocumentRevs, LocalDocument, PullFilter,
    RevisionId, RevsDiffRequest, RevsDiffResponse, Sequence, WireMessage,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// How many times a single call may be re-issued on interceptor request.
pub const MAX_REPLAYS: usize = 2;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        })
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL, query included.
    pub url: Url,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Optional body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Creates a request without headers or body.
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Attaches a JSON body.
    pub fn with_json(mut self, body: Vec<u8>) -> Self {
        self.set_header("Content-Type", "application/json");
        self.body = Some(body);
        self
    }

    /// Returns a header value, matching the name case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Sets a header, replacing any existing value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }
}

/// An inbound response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Body bytes.
    pub body: Vec<u8>,
    /// Set by a response interceptor to have the request sent again.
    pub replay: bool,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
            replay: false,
        }
    }

    /// Creates a response with a JSON-encoded body.
    pub fn json<M: WireMessage>(status: u16, message: &M) -> ReplicationResult<Self> {
        Ok(Self::new(status, message.encode()?).with_header("Content-Type", "application/json"))
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns a header value, matching the name case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err`
/// means the request never produced a response (connection refused,
/// timeout and the like); HTTP error statuses are returned as responses.
pub trait HttpClient: Send + Sync {
    /// Executes one request.
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, String>;
}

/// Client for a CouchDB-style remote database.
///
/// Every call is routed through the interceptor chain.
pub struct CouchClient {
    root: Url,
    client: Arc<dyn HttpClient>,
    chain: InterceptorChain,
}

impl CouchClient {
    /// Creates a client for the database at `root`.
    ///
    /// `root` must not carry credentials.
    pub fn new(root: Url, client: Arc<dyn HttpClient>, chain: InterceptorChain) -> Self {
        Self {
            root,
            client,
            chain,
        }
    }

    /// Returns the database URL.
    pub fn root(&self) -> &Url {
        &self.root
    }

    /// Returns the interceptor chain.
    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    fn endpoint(&self, segments: &[&str]) -> ReplicationResult<Url> {
        let mut url = self.root.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ReplicationError::Configuration(format!("{} cannot be a base URL", self.root))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sends a request through the interceptor chain without checking the
    /// status.
    fn send(&self, request: HttpRequest) -> ReplicationResult<HttpResponse> {
        let mut replays = 0;
        loop {
            let outbound = self.chain.apply_request(request.clone())?;
            debug!(method = %outbound.method, path = outbound.url.path(), "sending request");

            let response = self
                .client
                .execute(&outbound)
                .map_err(ReplicationError::network_retryable)?;
            let response = self.chain.apply_response(response)?;

            if response.replay && replays < MAX_REPLAYS {
                replays += 1;
                debug!(
                    method = %outbound.method,
                    path = outbound.url.path(),
                    replays,
                    "replaying request"
                );
                continue;
            }
            return Ok(response);
        }
    }

    fn check_status(request: &HttpRequest, response: HttpResponse) -> ReplicationResult<HttpResponse> {
        if response.is_success() {
            return Ok(response);
        }
        let message = format!(
            "{} {} returned {}",
            request.method,
            request.url.path(),
            response.status
        );
        warn!(status = response.status, path = request.url.path(), "request failed");
        if response.status >= 500 {
            Err(ReplicationError::network_retryable(message))
        } else {
            Err(ReplicationError::network_fatal(message))
        }
    }

    fn call<Res: WireMessage>(&self, request: HttpRequest) -> ReplicationResult<Res> {
        let response = self.send(request.clone())?;
        let response = Self::check_status(&request, response)?;
        Ok(Res::decode(&response.body)?)
    }

    fn post<Req: WireMessage, Res: WireMessage>(
        &self,
        segments: &[&str],
        body: &Req,
    ) -> ReplicationResult<Res> {
        let request =
            HttpRequest::new(HttpMethod::Post, self.endpoint(segments)?).with_json(body.encode()?);
        self.call(request)
    }

    /// Reads a `_local` document. A 404 means it does not exist.
    pub fn get_local(&self, id: &str) -> ReplicationResult<Option<LocalDocument>> {
        let request = HttpRequest::new(HttpMethod::Get, self.endpoint(&["_local", id])?);
        let response = self.send(request.clone())?;
        if response.status == 404 {
            return Ok(None);
        }
        let response = Self::check_status(&request, response)?;
        Ok(Some(LocalDocument::decode(&response.body)?))
    }

    /// Writes a `_local` document.
    pub fn put_local(&self, document: &LocalDocument) -> ReplicationResult<()> {
        let request = HttpRequest::new(HttpMethod::Put, self.endpoint(&["_local", &document.id])?)
            .with_json(document.encode()?);
        let response = self.send(request.clone())?;
        Self::check_status(&request, response)?;
        Ok(())
    }

    /// Fetches the database summary.
    pub fn info(&self) -> ReplicationResult<DatabaseInfo> {
        self.call(HttpRequest::new(HttpMethod::Get, self.root.clone()))
    }
}

impl fmt::Debug for CouchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CouchClient")
            .field("root", &self.root.as_str())
            .field("chain", &self.chain)
            .finish()
    }
}

impl DocumentStore for CouchClient {
    fn identifier(&self) -> String {
        self.root.to_string()
    }

    fn changes(
        &self,
        since: Sequence,
        limit: u32,
        filter: Option<&PullFilter>,
    ) -> ReplicationResult<ChangesResponse> {
        let mut url = self.endpoint(&["_changes"])?;
        url.query_pairs_mut()
            .extend_pairs(ChangesRequest::new(since, limit, filter.cloned()).query_pairs());
        self.call(HttpRequest::new(HttpMethod::Get, url))
    }

    fn revs_diff(
        &self,
        candidates: &BTreeMap<String, Vec<RevisionId>>,
    ) -> ReplicationResult<BTreeMap<String, Vec<RevisionId>>> {
        let response: RevsDiffResponse =
            self.post(&["_revs_diff"], &RevsDiffRequest(candidates.clone()))?;
        Ok(response.into_missing())
    }

    fn bulk_get(&self, items: &[BulkGetItem]) -> ReplicationResult<Vec<DocumentRevs>> {
        let response: BulkGetResponse = self.post(
            &["_bulk_get"],
            &BulkGetRequest {
                docs: items.to_vec(),
            },
        )?;
        Ok(response.results)
    }

    fn bulk_insert(&self, documents: &[DocumentRevs]) -> ReplicationResult<usize> {
        let response: BulkDocsResponse = self.post(
            &["_bulk_docs"],
            &BulkDocsRequest::replicated(documents.to_vec()),
        )?;
        Ok(response.inserted)
    }

    fn document_count(&self) -> ReplicationResult<usize> {
        Ok(self.info()?.doc_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::ResponseInterceptor;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<Result<HttpResponse, String>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn with(responses: Vec<Result<HttpResponse, String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl HttpClient for Scripted {
        fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
            self.seen.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err("no scripted response".into()))
        }
    }

    fn client(http: Arc<Scripted>, chain: InterceptorChain) -> CouchClient {
        CouchClient::new(Url::parse("http://couch:5984/animals").unwrap(), http, chain)
    }

    #[test]
    fn changes_builds_query() {
        let body = ChangesResponse::new(Vec::new(), Sequence::new(7));
        let http = Scripted::with(vec![HttpResponse::json(200, &body).map_err(|e| e.to_string())]);
        let couch = client(http.clone(), InterceptorChain::new());

        let filter = PullFilter::new("app/by_type").with_parameter("type", "cat");
        let page = couch.changes(Sequence::new(3), 25, Some(&filter)).unwrap();
        assert_eq!(page.last_seq, Sequence::new(7));

        let seen = http.seen.lock();
        assert_eq!(seen[0].method, HttpMethod::Get);
        assert_eq!(seen[0].url.path(), "/animals/_changes");
        assert_eq!(
            seen[0].url.query(),
            Some("style=all_docs&since=3&limit=25&filter=app%2Fby_type&type=cat")
        );
    }

    #[test]
    fn status_mapping() {
        let http = Scripted::with(vec![
            Ok(HttpResponse::new(503, Vec::new())),
            Ok(HttpResponse::new(400, Vec::new())),
            Err("connection refused".into()),
            Ok(HttpResponse::new(200, b"not json".to_vec())),
        ]);
        let couch = client(http, InterceptorChain::new());

        let err = couch.document_count().unwrap_err();
        assert!(err.is_retryable());
        let err = couch.document_count().unwrap_err();
        assert!(matches!(err, ReplicationError::Network { retryable: false, .. }));
        let err = couch.document_count().unwrap_err();
        assert!(err.is_retryable());
        let err = couch.document_count().unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol(_)));
    }

    #[test]
    fn missing_local_document_is_none() {
        let http = Scripted::with(vec![Ok(HttpResponse::new(404, Vec::new()))]);
        let couch = client(http.clone(), InterceptorChain::new());

        assert_eq!(couch.get_local("docsync-checkpoint-abc").unwrap(), None);
        assert_eq!(
            http.seen.lock()[0].url.path(),
            "/animals/_local/docsync-checkpoint-abc"
        );
    }

    struct ReplayUnauthorized;

    impl ResponseInterceptor for ReplayUnauthorized {
        fn on_response(&self, mut response: HttpResponse) -> ReplicationResult<HttpResponse> {
            response.replay = response.status == 401;
            Ok(response)
        }
    }

    #[test]
    fn replay_is_bounded() {
        let info = DatabaseInfo {
            db_name: "animals".into(),
            doc_count: 2,
            update_seq: Sequence::new(2),
        };
        let http = Scripted::with(vec![
            Ok(HttpResponse::new(401, Vec::new())),
            HttpResponse::json(200, &info).map_err(|e| e.to_string()),
        ]);
        let mut chain = InterceptorChain::new();
        chain.push_response(Arc::new(ReplayUnauthorized));
        let couch = client(http.clone(), chain.clone());
        assert_eq!(couch.document_count().unwrap(), 2);
        assert_eq!(http.seen.lock().len(), 2);

        let always = Scripted::with(
            (0..=MAX_REPLAYS + 1)
                .map(|_| Ok(HttpResponse::new(401, Vec::new())))
                .collect(),
        );
        let couch = client(always.clone(), chain);
        assert!(couch.document_count().is_err());
        assert_eq!(always.seen.lock().len(), MAX_REPLAYS + 1);
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut request = HttpRequest::new(HttpMethod::Get, Url::parse("http://h/").unwrap());
        request.set_header("Cookie", "a=1");
        request.set_header("cookie", "a=2");
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.header("COOKIE"), Some("a=2"));
    }
}
