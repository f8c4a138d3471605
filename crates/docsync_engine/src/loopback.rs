//! An in-process CouchDB-style endpoint.
//!
//! [`LoopbackRemote`] implements [`HttpClient`] by answering requests from
//! a [`MemoryDatastore`] instead of the network. It serves the replication
//! endpoints plus `_session`, can require credentials, and can be told to
//! fail specific routes. Tests use it as the remote side of a replication.

use crate::cookie::SESSION_COOKIE;
use crate::error::{ReplicationError, ReplicationResult};
use crate::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use crate::memory::MemoryDatastore;
use crate::store::DocumentStore;
use docsync_protocol::{
    BulkDocsRequest, BulkDocsResponse, BulkGetRequest, BulkGetResponse, ChangesRequest,
    DatabaseInfo, LocalDocument, RevsDiffRequest, RevsDiffResponse, WireMessage,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use url::{form_urlencoded, Url};
use uuid::Uuid;

/// Endpoint families served by [`LoopbackRemote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// `POST /_session`
    Session,
    /// `GET {db}`
    Info,
    /// `GET {db}/_changes`
    Changes,
    /// `POST {db}/_revs_diff`
    RevsDiff,
    /// `POST {db}/_bulk_get`
    BulkGet,
    /// `POST {db}/_bulk_docs`
    BulkDocs,
    /// `GET|PUT {db}/_local/{id}`
    Local,
}

const DEFAULT_CHANGES_LIMIT: u32 = 1000;

/// Serves one database from a [`MemoryDatastore`].
pub struct LoopbackRemote {
    root: Url,
    store: Arc<MemoryDatastore>,
    credentials: Option<(String, String)>,
    sessions: Mutex<HashSet<String>>,
    failures: Mutex<HashMap<Route, usize>>,
    requests: AtomicUsize,
    session_requests: AtomicUsize,
    authorization_headers: AtomicUsize,
}

impl LoopbackRemote {
    /// Serves `store` at the database URL `root`.
    pub fn new(root: &str, store: Arc<MemoryDatastore>) -> ReplicationResult<Self> {
        let root = Url::parse(root)
            .map_err(|err| ReplicationError::Configuration(format!("invalid root: {}", err)))?;
        Ok(Self {
            root,
            store,
            credentials: None,
            sessions: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            requests: AtomicUsize::new(0),
            session_requests: AtomicUsize::new(0),
            authorization_headers: AtomicUsize::new(0),
        })
    }

    /// Requires a session obtained with these credentials.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<MemoryDatastore> {
        &self.store
    }

    /// Makes the next `times` requests to `route` answer 500.
    pub fn fail_next(&self, route: Route, times: usize) {
        *self.failures.lock().entry(route).or_insert(0) += times;
    }

    /// Invalidates every issued session cookie.
    pub fn expire_sessions(&self) {
        self.sessions.lock().clear();
    }

    /// Total requests received.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Requests received on `_session`.
    pub fn session_count(&self) -> usize {
        self.session_requests.load(Ordering::SeqCst)
    }

    /// Requests that carried an `Authorization` header.
    pub fn authorization_header_count(&self) -> usize {
        self.authorization_headers.load(Ordering::SeqCst)
    }

    fn route(&self, url: &Url) -> Option<(Route, Option<String>)> {
        if url.path() == "/_session" {
            return Some((Route::Session, None));
        }
        let root: Vec<&str> = self
            .root
            .path_segments()?
            .filter(|segment| !segment.is_empty())
            .collect();
        let path: Vec<&str> = url
            .path_segments()?
            .filter(|segment| !segment.is_empty())
            .collect();
        let rest = path.strip_prefix(root.as_slice())?;

        match rest {
            [] => Some((Route::Info, None)),
            ["_changes"] => Some((Route::Changes, None)),
            ["_revs_diff"] => Some((Route::RevsDiff, None)),
            ["_bulk_get"] => Some((Route::BulkGet, None)),
            ["_bulk_docs"] => Some((Route::BulkDocs, None)),
            ["_local", id] => {
                let id = urlencoding::decode(id).ok()?.into_owned();
                Some((Route::Local, Some(id)))
            }
            _ => None,
        }
    }

    fn take_failure(&self, route: Route) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(&route) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }

    fn login(&self, request: &HttpRequest) -> HttpResponse {
        self.session_requests.fetch_add(1, Ordering::SeqCst);
        let form: HashMap<String, String> = request
            .body
            .as_deref()
            .map(|body| form_urlencoded::parse(body).into_owned().collect())
            .unwrap_or_default();

        let accepted = match &self.credentials {
            Some((username, password)) => {
                form.get("name") == Some(username) && form.get("password") == Some(password)
            }
            None => true,
        };
        if !accepted {
            return HttpResponse::new(401, b"{\"error\":\"unauthorized\"}".to_vec());
        }

        let token = Uuid::new_v4().simple().to_string();
        self.sessions.lock().insert(token.clone());
        HttpResponse::new(200, b"{\"ok\":true}".to_vec()).with_header(
            "Set-Cookie",
            format!("{}={}; Version=1; Path=/; HttpOnly", SESSION_COOKIE, token),
        )
    }

    fn authorized(&self, request: &HttpRequest) -> bool {
        if self.credentials.is_none() {
            return true;
        }
        let prefix = format!("{}=", SESSION_COOKIE);
        let sessions = self.sessions.lock();
        request
            .header("cookie")
            .into_iter()
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().strip_prefix(prefix.as_str()))
            .any(|token| sessions.contains(token))
    }

    fn handle(
        &self,
        route: Route,
        local_id: Option<String>,
        request: &HttpRequest,
    ) -> ReplicationResult<HttpResponse> {
        let body = request.body.as_deref().unwrap_or_default();
        match (route, request.method) {
            (Route::Info, HttpMethod::Get) => {
                let info = DatabaseInfo {
                    db_name: self
                        .root
                        .path_segments()
                        .and_then(|mut segments| segments.next_back())
                        .unwrap_or_default()
                        .to_string(),
                    doc_count: self.store.document_count()?,
                    update_seq: self.store.last_sequence(),
                };
                HttpResponse::json(200, &info)
            }
            (Route::Changes, HttpMethod::Get) => {
                let query = ChangesRequest::from_query_pairs(
                    request.url.query_pairs().into_owned(),
                    DEFAULT_CHANGES_LIMIT,
                );
                let page = self
                    .store
                    .changes(query.since, query.limit, query.filter.as_ref())?;
                HttpResponse::json(200, &page)
            }
            (Route::RevsDiff, HttpMethod::Post) => {
                let RevsDiffRequest(candidates) = RevsDiffRequest::decode(body)?;
                let missing = self.store.revs_diff(&candidates)?;
                HttpResponse::json(200, &RevsDiffResponse::from_missing(missing))
            }
            (Route::BulkGet, HttpMethod::Post) => {
                let request = BulkGetRequest::decode(body)?;
                let results = self.store.bulk_get(&request.docs)?;
                HttpResponse::json(200, &BulkGetResponse { results })
            }
            (Route::BulkDocs, HttpMethod::Post) => {
                let request = BulkDocsRequest::decode(body)?;
                if request.new_edits {
                    return Ok(HttpResponse::new(
                        400,
                        b"{\"error\":\"new_edits must be false\"}".to_vec(),
                    ));
                }
                let inserted = self.store.bulk_insert(&request.docs)?;
                HttpResponse::json(201, &BulkDocsResponse { ok: true, inserted })
            }
            (Route::Local, HttpMethod::Get) => {
                let id = local_id.unwrap_or_default();
                match self.store.get_local(&id) {
                    Some(document) => HttpResponse::json(200, &document),
                    None => Ok(HttpResponse::new(404, b"{\"error\":\"not_found\"}".to_vec())),
                }
            }
            (Route::Local, HttpMethod::Put) => {
                let document = LocalDocument::decode(body)?;
                if Some(&document.id) != local_id.as_ref() {
                    return Ok(HttpResponse::new(400, b"{\"error\":\"id mismatch\"}".to_vec()));
                }
                self.store.put_local(document.clone());
                HttpResponse::json(201, &document)
            }
            _ => Ok(HttpResponse::new(405, Vec::new())),
        }
    }
}

impl HttpClient for LoopbackRemote {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if request.header("authorization").is_some() {
            self.authorization_headers.fetch_add(1, Ordering::SeqCst);
        }

        let Some((route, local_id)) = self.route(&request.url) else {
            return Ok(HttpResponse::new(404, b"{\"error\":\"not_found\"}".to_vec()));
        };
        debug!(?route, method = %request.method, "loopback request");

        if self.take_failure(route) {
            return Ok(HttpResponse::new(500, b"{\"error\":\"injected\"}".to_vec()));
        }
        if route == Route::Session {
            return Ok(self.login(request));
        }
        if !self.authorized(request) {
            return Ok(HttpResponse::new(401, b"{\"error\":\"unauthorized\"}".to_vec()));
        }

        match self.handle(route, local_id, request) {
            Ok(response) => Ok(response),
            Err(err @ (ReplicationError::Store(_) | ReplicationError::Protocol(_))) => {
                Ok(HttpResponse::new(400, err.to_string().into_bytes()))
            }
            Err(err) => Ok(HttpResponse::new(500, err.to_string().into_bytes())),
        }
    }
}
