//! Request/response rewriting: path, host and headers.
//!
//! Path operations apply in order: `replace_path`, `strip_prefix`,
//! `add_prefix`. The query string is kept.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, Uri};
use serde::Deserialize;

use crate::middleware::{BuildContext, Middleware, RoundTrip, Transport};
use crate::proxy::error::{BuildError, ProxyError};

pub const NAME: &str = "rewrite";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeaderEdits {
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RewriteParams {
    pub replace_path: Option<String>,
    pub strip_prefix: Option<String>,
    pub add_prefix: Option<String>,
    pub host: Option<String>,
    pub request_headers: HeaderEdits,
    pub response_headers: HeaderEdits,
}

#[derive(Debug, Default)]
struct CompiledEdits {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl CompiledEdits {
    fn compile(edits: &HeaderEdits) -> Result<Self, String> {
        let set = edits
            .set
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| format!("header `{}`: {}", name, e))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| format!("header `{}` value: {}", name, e))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, String>>()?;
        let remove = edits
            .remove
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| format!("header `{}`: {}", name, e))
            })
            .collect::<Result<Vec<_>, String>>()?;
        Ok(Self { set, remove })
    }

    fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
    }
}

#[derive(Debug)]
struct Rewrite {
    replace_path: Option<String>,
    strip_prefix: Option<String>,
    add_prefix: Option<String>,
    host: Option<HeaderValue>,
    request_headers: CompiledEdits,
    response_headers: CompiledEdits,
}

impl Rewrite {
    fn rewrite_path(&self, path: &str) -> String {
        let mut path = self.replace_path.as_deref().unwrap_or(path).to_string();
        if let Some(prefix) = &self.strip_prefix {
            let prefix = prefix.trim_end_matches('/');
            // Only whole segments: `/api` strips `/api/x` and `/api`, not `/apiv2`.
            let stripped = match path.strip_prefix(prefix) {
                Some("") => Some("/".to_string()),
                Some(rest) if rest.starts_with('/') => Some(rest.to_string()),
                _ => None,
            };
            if let Some(stripped) = stripped {
                path = stripped;
            }
        }
        if let Some(prefix) = &self.add_prefix {
            path = format!("{}{}", prefix.trim_end_matches('/'), path);
        }
        path
    }

    fn rewrite_uri(&self, uri: &Uri) -> Result<Uri, ProxyError> {
        if self.replace_path.is_none() && self.strip_prefix.is_none() && self.add_prefix.is_none() {
            return Ok(uri.clone());
        }
        let path = self.rewrite_path(uri.path());
        let path_and_query = match uri.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(
            path_and_query
                .parse()
                .map_err(|e| ProxyError::InvalidRequest(format!("rewritten path: {}", e)))?,
        );
        Uri::from_parts(parts).map_err(|e| ProxyError::InvalidRequest(e.to_string()))
    }
}

struct RewriteLayer(Arc<Rewrite>);

struct RewriteTransport {
    rewrite: Arc<Rewrite>,
    next: Transport,
}

impl Middleware for RewriteLayer {
    fn wrap(&self, next: Transport) -> Transport {
        Arc::new(RewriteTransport {
            rewrite: self.0.clone(),
            next,
        })
    }
}

#[async_trait]
impl RoundTrip for RewriteTransport {
    async fn round_trip(&self, mut request: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let rewrite = &self.rewrite;
        *request.uri_mut() = rewrite.rewrite_uri(request.uri())?;
        if let Some(host) = &rewrite.host {
            request.headers_mut().insert(header::HOST, host.clone());
        }
        rewrite.request_headers.apply(request.headers_mut());

        let mut response = self.next.round_trip(request).await?;
        rewrite.response_headers.apply(response.headers_mut());
        Ok(response)
    }
}

pub fn factory(ctx: &BuildContext<'_>) -> Result<Arc<dyn Middleware>, BuildError> {
    let invalid = |reason: String| BuildError::InvalidParams {
        route: ctx.route().to_string(),
        middleware: ctx.name().to_string(),
        reason,
    };

    let params: RewriteParams = ctx.params()?;
    for path in [&params.replace_path, &params.strip_prefix, &params.add_prefix]
        .into_iter()
        .flatten()
    {
        if !path.starts_with('/') {
            return Err(invalid(format!("path `{}` must start with `/`", path)));
        }
    }
    let host = params
        .host
        .as_deref()
        .map(HeaderValue::from_str)
        .transpose()
        .map_err(|e| invalid(format!("host: {}", e)))?;

    Ok(Arc::new(RewriteLayer(Arc::new(Rewrite {
        replace_path: params.replace_path,
        strip_prefix: params.strip_prefix,
        add_prefix: params.add_prefix,
        host,
        request_headers: CompiledEdits::compile(&params.request_headers).map_err(invalid)?,
        response_headers: CompiledEdits::compile(&params.response_headers).map_err(invalid)?,
    }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MiddlewareConfig;
    use crate::proxy::state::StateArena;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Echoes the URI, host and `x-debug` header it received.
    struct Echo;

    #[async_trait]
    impl RoundTrip for Echo {
        async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, ProxyError> {
            let host = request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let debug = request.headers().contains_key("x-debug");
            let mut response = Response::new(Body::from(format!("{} {} {}", request.uri(), host, debug)));
            response
                .headers_mut()
                .insert("server", HeaderValue::from_static("backend/1.0"));
            Ok(response)
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

    #[tokio::test]
    async fn test_rewrites_request_and_response() {
        let chain = build(json!({
            "strip_prefix": "/api",
            "add_prefix": "/internal/",
            "host": "svc-a.internal",
            "request_headers": { "remove": ["x-debug"], "set": { "x-gateway": "edge" } },
            "response_headers": { "remove": ["server"], "set": { "x-served-by": "gw" } }
        }))
        .unwrap();

        let request = Request::builder()
            .uri("/api/v1/users?page=2")
            .header("host", "api.example.com")
            .header("x-debug", "1")
            .body(Body::empty())
            .unwrap();
        let response = chain.round_trip(request).await.unwrap();

        assert!(response.headers().get("server").is_none());
        assert_eq!(response.headers()["x-served-by"], "gw");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"/internal/v1/users?page=2 svc-a.internal false");
    }

    #[tokio::test]
    async fn test_replace_path() {
        let chain = build(json!({ "replace_path": "/health" })).unwrap();
        let response = chain
            .round_trip(Request::builder().uri("/anything").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.starts_with(b"/health "));
    }

    #[test]
    fn test_strip_prefix_respects_segments() {
        let rewrite = Rewrite {
            replace_path: None,
            strip_prefix: Some("/api".to_string()),
            add_prefix: None,
            host: None,
            request_headers: CompiledEdits::default(),
            response_headers: CompiledEdits::default(),
        };
        assert_eq!(rewrite.rewrite_path("/api/v1"), "/v1");
        assert_eq!(rewrite.rewrite_path("/api"), "/");
        assert_eq!(rewrite.rewrite_path("/apiv2/x"), "/apiv2/x");
        assert_eq!(rewrite.rewrite_path("/other"), "/other");
    }

    #[test]
    fn test_invalid_params() {
        assert!(build(json!({ "strip_prefix": "api" })).is_err());
        assert!(build(json!({ "request_headers": { "set": { "bad header": "x" } } })).is_err());
        assert!(build(json!({ "prefix": "/x" })).is_err());
    }
}
