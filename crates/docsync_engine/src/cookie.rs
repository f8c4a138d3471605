//! Cookie session authentication.

use crate::error::{ReplicationError, ReplicationResult};
use crate::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use crate::interceptor::{RequestInterceptor, ResponseInterceptor};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use url::form_urlencoded;
use url::Url;

/// Name of the session cookie issued by `_session`.
pub const SESSION_COOKIE: &str = "AuthSession";

/// Authenticates every call with a session cookie.
///
/// The credentials are exchanged once at `{server}/_session` for an
/// `AuthSession` cookie, which is then attached to each request. When the
/// server rejects the cookie (401 or 403) it is dropped and the call is
/// replayed, which logs in again. Credentials are never sent with ordinary
/// requests.
pub struct CookieInterceptor {
    session_url: Url,
    form_body: String,
    client: Arc<dyn HttpClient>,
    cookie: Mutex<Option<String>>,
}

impl CookieInterceptor {
    /// Creates an interceptor for the server hosting `database`.
    pub fn new(
        database: &Url,
        username: &str,
        password: &str,
        client: Arc<dyn HttpClient>,
    ) -> ReplicationResult<Self> {
        let session_url = database.join("/_session").map_err(|e| {
            ReplicationError::Configuration(format!("cannot derive session endpoint: {}", e))
        })?;
        let form_body = form_urlencoded::Serializer::new(String::new())
            .append_pair("name", username)
            .append_pair("password", password)
            .finish();

        Ok(Self {
            session_url,
            form_body,
            client,
            cookie: Mutex::new(None),
        })
    }

    /// Returns the form-encoded login body.
    pub fn form_body(&self) -> &str {
        &self.form_body
    }

    /// Returns the session endpoint.
    pub fn session_url(&self) -> &Url {
        &self.session_url
    }

    /// Returns true while a session cookie is held.
    pub fn has_session(&self) -> bool {
        self.cookie.lock().is_some()
    }

    fn login(&self) -> ReplicationResult<String> {
        let mut request = HttpRequest::new(HttpMethod::Post, self.session_url.clone());
        request.set_header("Content-Type", "application/x-www-form-urlencoded");
        request.body = Some(self.form_body.clone().into_bytes());

        let response = self
            .client
            .execute(&request)
            .map_err(ReplicationError::network_retryable)?;
        if !response.is_success() {
            let message = format!("session request returned {}", response.status);
            return Err(if response.status >= 500 {
                ReplicationError::network_retryable(message)
            } else {
                ReplicationError::network_fatal(message)
            });
        }

        let cookie = response
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, value)| value.split(';').next())
            .map(str::trim)
            .find(|pair| {
                pair.split_once('=')
                    .is_some_and(|(name, _)| name == SESSION_COOKIE)
            })
            .ok_or_else(|| {
                ReplicationError::network_fatal("session response carried no AuthSession cookie")
            })?;

        debug!(session = %self.session_url, "obtained session cookie");
        Ok(cookie.to_string())
    }
}

impl RequestInterceptor for CookieInterceptor {
    fn on_request(&self, mut request: HttpRequest) -> ReplicationResult<HttpRequest> {
        // Held across login so concurrent fetches share one session.
        let mut cookie = self.cookie.lock();
        let value = match cookie.as_ref() {
            Some(value) => value.clone(),
            None => {
                let value = self.login()?;
                *cookie = Some(value.clone());
                value
            }
        };
        request.set_header("Cookie", value);
        Ok(request)
    }
}

impl ResponseInterceptor for CookieInterceptor {
    fn on_response(&self, mut response: HttpResponse) -> ReplicationResult<HttpResponse> {
        if matches!(response.status, 401 | 403) && self.cookie.lock().take().is_some() {
            debug!(status = response.status, "session rejected, replaying");
            response.replay = true;
        }
        Ok(response)
    }
}

impl fmt::Debug for CookieInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieInterceptor")
            .field("session_url", &self.session_url.as_str())
            .field("has_session", &self.has_session())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SessionServer {
        logins: AtomicUsize,
    }

    impl HttpClient for SessionServer {
        fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
            assert_eq!(request.url.path(), "/_session");
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(HttpResponse::new(200, b"{\"ok\":true}".to_vec())
                .with_header("Set-Cookie", format!("AuthSession=token{}; Path=/; HttpOnly", n)))
        }
    }

    fn interceptor() -> (CookieInterceptor, Arc<SessionServer>) {
        let server = Arc::new(SessionServer {
            logins: AtomicUsize::new(0),
        });
        let db = Url::parse("http://couch:5984/animals").unwrap();
        let cookie = CookieInterceptor::new(&db, "tom", "s3cret", server.clone()).unwrap();
        (cookie, server)
    }

    fn request() -> HttpRequest {
        HttpRequest::new(
            HttpMethod::Get,
            Url::parse("http://couch:5984/animals/_changes").unwrap(),
        )
    }

    #[test]
    fn logs_in_once_and_attaches_cookie() {
        let (cookie, server) = interceptor();
        assert_eq!(cookie.session_url().as_str(), "http://couch:5984/_session");

        let first = cookie.on_request(request()).unwrap();
        let second = cookie.on_request(request()).unwrap();
        assert_eq!(first.header("cookie"), Some("AuthSession=token1"));
        assert_eq!(second.header("cookie"), Some("AuthSession=token1"));
        assert!(first.header("authorization").is_none());
        assert_eq!(server.logins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_session_is_renewed() {
        let (cookie, server) = interceptor();
        cookie.on_request(request()).unwrap();

        let response = cookie.on_response(HttpResponse::new(401, Vec::new())).unwrap();
        assert!(response.replay);
        assert!(!cookie.has_session());

        let renewed = cookie.on_request(request()).unwrap();
        assert_eq!(renewed.header("cookie"), Some("AuthSession=token2"));
        assert_eq!(server.logins.load(Ordering::SeqCst), 2);

        // Without a held cookie there is nothing to renew.
        let (fresh, _) = interceptor();
        let response = fresh.on_response(HttpResponse::new(403, Vec::new())).unwrap();
        assert!(!response.replay);
    }

    #[test]
    fn form_body_encodes_utf8() {
        let db = Url::parse("http://h/db").unwrap();
        let server = Arc::new(SessionServer {
            logins: AtomicUsize::new(0),
        });
        let cookie = CookieInterceptor::new(&db, "🍶", "a&b=c", server).unwrap();
        assert_eq!(cookie.form_body(), "name=%F0%9F%8D%B6&password=a%26b%3Dc");
        assert!(!format!("{:?}", cookie).contains("password"));
    }
}
