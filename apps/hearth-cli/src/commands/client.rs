use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

pub const DEFAULT_BASE: &str = "http://127.0.0.1:8090";
const ADMIN_HEADER: &str = "X-Hearth-Admin";

#[derive(Args, Clone, Debug)]
pub struct ClientArgs {
    /// Base URL of the hub
    #[arg(long, global = true, default_value = DEFAULT_BASE)]
    pub base: String,
    /// Admin token; falls back to HEARTH_ADMIN_TOKEN env
    #[arg(long, global = true)]
    pub admin_token: Option<String>,
    /// Timeout seconds per request
    #[arg(long, global = true, default_value_t = 10)]
    pub timeout: u64,
}

/// A non-2xx answer, carrying the problem-details title and detail.
#[derive(Debug)]
pub struct ApiFailure {
    pub status: u16,
    pub message: String,
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for ApiFailure {}

/// HTTP status of a failed call, when the hub answered at all.
pub fn failure_status(err: &anyhow::Error) -> Option<u16> {
    err.downcast_ref::<ApiFailure>().map(|failure| failure.status)
}

pub fn resolve_admin_token(opt: &Option<String>) -> Option<String> {
    opt.clone()
        .or_else(|| std::env::var("HEARTH_ADMIN_TOKEN").ok())
        .filter(|s| !s.trim().is_empty())
}

/// Render a problem-details body as one line.
pub fn problem_message(body: &JsonValue) -> Option<String> {
    let title = body.get("title").and_then(JsonValue::as_str);
    let detail = body.get("detail").and_then(JsonValue::as_str);
    match (title, detail) {
        (Some(title), Some(detail)) if !detail.is_empty() => Some(format!("{title}: {detail}")),
        (Some(title), _) => Some(title.to_string()),
        (None, Some(detail)) => Some(detail.to_string()),
        (None, None) => None,
    }
}

pub struct HubClient {
    base: String,
    token: Option<String>,
    http: Client,
}

impl HubClient {
    pub fn new(base: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    pub fn from_args(args: &ClientArgs) -> Result<Self> {
        Self::new(
            &args.base,
            resolve_admin_token(&args.admin_token),
            Duration::from_secs(args.timeout),
        )
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(token) = self.token.as_deref() {
            req = req.header(ADMIN_HEADER, token).bearer_auth(token);
        }
        req
    }

    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::GET, path), path)
    }

    pub fn get_query<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.send(self.request(Method::GET, path).query(query), path)
    }

    pub fn post<T: DeserializeOwned>(&self, path: &str, body: Option<&JsonValue>) -> Result<T> {
        let mut req = self.request(Method::POST, path);
        if let Some(body) = body {
            req = req.json(body);
        }
        self.send(req, path)
    }

    pub fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.request(Method::DELETE, path), path)
    }

    fn send<T: DeserializeOwned>(&self, req: RequestBuilder, path: &str) -> Result<T> {
        let resp = req
            .send()
            .with_context(|| format!("requesting {}{}", self.base, path))?;
        let status = resp.status();
        if !status.is_success() {
            let body: JsonValue = resp.json().unwrap_or(JsonValue::Null);
            let message = problem_message(&body).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
            tracing::debug!(path, status = status.as_u16(), "hub returned an error");
            return Err(ApiFailure {
                status: status.as_u16(),
                message,
            }
            .into());
        }
        resp.json()
            .with_context(|| format!("decoding response from {path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn base_url_drops_trailing_slashes() {
        let client = HubClient::new("http://127.0.0.1:8090//", None, Duration::from_secs(1)).unwrap();
        assert_eq!(client.base(), "http://127.0.0.1:8090");
    }

    #[test]
    fn problem_message_prefers_title_and_detail() {
        let body = json!({"type": "about:blank", "title": "Conflict", "status": 409, "detail": "busy"});
        assert_eq!(problem_message(&body).as_deref(), Some("Conflict: busy"));
        assert_eq!(
            problem_message(&json!({"title": "Not Found"})).as_deref(),
            Some("Not Found")
        );
        assert_eq!(problem_message(&JsonValue::Null), None);
    }

    #[test]
    fn admin_token_is_sent_on_both_headers() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(DELETE)
                .path("/queue")
                .header("authorization", "Bearer s3cret")
                .header("x-hearth-admin", "s3cret");
            then.status(200).json_body(json!({"deleted": true}));
        });
        let client = HubClient::new(&server.base_url(), Some("s3cret".into()), Duration::from_secs(5)).unwrap();
        let body: JsonValue = client.delete("/queue").unwrap();
        mock.assert();
        assert_eq!(body["deleted"], true);
    }

    #[test]
    fn error_status_is_recoverable_from_the_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/queue/apply");
            then.status(409).json_body(json!({
                "type": "about:blank",
                "title": "Conflict",
                "status": 409,
                "detail": "an apply is already running"
            }));
        });
        let client = HubClient::new(&server.base_url(), None, Duration::from_secs(5)).unwrap();
        let err = client.post::<JsonValue>("/queue/apply", None).unwrap_err();
        assert_eq!(failure_status(&err), Some(409));
        assert!(err.to_string().contains("already running"));
    }
}
