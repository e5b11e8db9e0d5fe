//! Bearer token authentication middleware.
//! Rejects requests without an accepted credential before any backend contact.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, Request, Response};
use serde::Deserialize;

use crate::middleware::{BuildContext, Middleware, RoundTrip, Transport};
use crate::observability::metrics;
use crate::proxy::error::{BuildError, ProxyError};

pub const NAME: &str = "auth";

/// Identity attached to authenticated requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

/// Checks a presented credential.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, String>;
}

/// Verifier backed by a fixed token table.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new<I, T, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (T, S)>,
        T: Into<String>,
        S: Into<String>,
    {
        Self {
            tokens: entries
                .into_iter()
                .map(|(t, s)| (t.into(), s.into()))
                .collect(),
        }
    }
}

impl TokenVerifier for StaticTokens {
    fn verify(&self, token: &str) -> Result<Principal, String> {
        self.tokens
            .get(token)
            .map(|subject| Principal {
                subject: subject.clone(),
            })
            .ok_or_else(|| "token not recognized".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenEntry {
    Token(String),
    Named { token: String, subject: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthParams {
    pub header: String,
    /// Credential prefix, e.g. `Bearer`. Empty takes the header value as is.
    pub scheme: String,
    /// Remove the credential header before forwarding.
    pub strip: bool,
    tokens: Vec<TokenEntry>,
}

impl Default for AuthParams {
    fn default() -> Self {
        Self {
            header: "authorization".to_string(),
            scheme: "Bearer".to_string(),
            strip: false,
            tokens: Vec::new(),
        }
    }
}

struct Auth {
    route: String,
    header: HeaderName,
    scheme: String,
    strip: bool,
    verifier: Arc<dyn TokenVerifier>,
}

struct AuthLayer(Arc<Auth>);

struct AuthTransport {
    auth: Arc<Auth>,
    next: Transport,
}

impl Auth {
    fn credential<'r>(&self, request: &'r Request<Body>) -> Option<&'r str> {
        let value = request.headers().get(&self.header)?.to_str().ok()?.trim();
        if self.scheme.is_empty() {
            return Some(value);
        }
        let (scheme, token) = value.split_once(' ')?;
        scheme
            .eq_ignore_ascii_case(&self.scheme)
            .then(|| token.trim())
    }
}

impl Middleware for AuthLayer {
    fn wrap(&self, next: Transport) -> Transport {
        Arc::new(AuthTransport {
            auth: self.0.clone(),
            next,
        })
    }
}

#[async_trait]
impl RoundTrip for AuthTransport {
    async fn round_trip(&self, mut request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let auth = &self.auth;
        let verdict = match auth.credential(&request) {
            Some(token) => auth.verifier.verify(token),
            None => Err("missing credential".to_string()),
        };

        match verdict {
            Ok(principal) => {
                if auth.strip {
                    request.headers_mut().remove(&auth.header);
                }
                request.extensions_mut().insert(principal);
                self.next.round_trip(request).await
            }
            Err(reason) => {
                tracing::debug!(route = %auth.route, reason = %reason, "Authentication failed");
                metrics::record_rejection(&auth.route, "forbidden");
                Err(ProxyError::Forbidden(reason))
            }
        }
    }
}

/// Auth middleware with a caller-supplied verifier.
pub fn with_verifier(
    route: &str,
    params: &AuthParams,
    verifier: Arc<dyn TokenVerifier>,
) -> Result<Arc<dyn Middleware>, String> {
    let header = HeaderName::from_bytes(params.header.as_bytes()).map_err(|e| e.to_string())?;
    Ok(Arc::new(AuthLayer(Arc::new(Auth {
        route: route.to_string(),
        header,
        scheme: params.scheme.clone(),
        strip: params.strip,
        verifier,
    }))))
}

pub fn factory(ctx: &BuildContext<'_>) -> Result<Arc<dyn Middleware>, BuildError> {
    let invalid = |reason: String| BuildError::InvalidParams {
        route: ctx.route().to_string(),
        middleware: ctx.name().to_string(),
        reason,
    };

    let params: AuthParams = ctx.params()?;
    if params.tokens.is_empty() {
        return Err(invalid("at least one token is required".to_string()));
    }

    let verifier = StaticTokens::new(params.tokens.iter().enumerate().map(|(i, entry)| match entry {
        TokenEntry::Token(token) => (token.clone(), format!("token-{}", i)),
        TokenEntry::Named { token, subject } => (token.clone(), subject.clone()),
    }));

    with_verifier(ctx.route(), &params, Arc::new(verifier)).map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MiddlewareConfig;
    use crate::proxy::state::StateArena;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct Echo;

    #[async_trait]
    impl RoundTrip for Echo {
        async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
            let subject = request
                .extensions()
                .get::<Principal>()
                .map(|p| p.subject.clone())
                .unwrap_or_default();
            let leaked = request.headers().contains_key("authorization");
            Ok(Response::new(Body::from(format!("{}:{}", subject, leaked))))
        }
    }

    fn build(params: serde_json::Value) -> Result<Transport, BuildError> {
        let mut config = MiddlewareConfig::new(NAME);
        if let serde_json::Value::Object(map) = params {
            config.params = map;
        }
        let arena = StateArena::new();
        let touched = Mutex::new(HashSet::new());
        let ctx = BuildContext::new("r", "svc", &config, &arena, &touched);
        Ok(factory(&ctx)?.wrap(Arc::new(Echo)))
    }

    fn request(authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = authorization {
            builder = builder.header("authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_accepts_known_token() {
        let chain = build(json!({
            "tokens": ["s3cret", { "token": "t2", "subject": "billing" }],
            "strip": true
        }))
        .unwrap();

        let response = chain.round_trip(request(Some("Bearer t2"))).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"billing:false");

        assert!(chain.round_trip(request(Some("bearer s3cret"))).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_missing_or_unknown() {
        let chain = build(json!({ "tokens": ["s3cret"] })).unwrap();

        let missing = chain.round_trip(request(None)).await.unwrap_err();
        assert_eq!(missing.status(), StatusCode::FORBIDDEN);

        let wrong = chain.round_trip(request(Some("Bearer nope"))).await.unwrap_err();
        assert_eq!(wrong.status(), StatusCode::FORBIDDEN);

        let scheme = chain.round_trip(request(Some("Basic s3cret"))).await.unwrap_err();
        assert!(matches!(scheme, ProxyError::Forbidden(_)));
    }

    #[test]
    fn test_requires_tokens() {
        assert!(matches!(build(json!({})), Err(BuildError::InvalidParams { .. })));
        assert!(matches!(
            build(json!({ "tokens": ["x"], "realm": "y" })),
            Err(BuildError::InvalidParams { .. })
        ));
    }
}
