use axum::http;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use serde::Serialize;
use std::collections::HashMap;

use depwatch_core::{
    CorrelationId, Direction, EventType, RecordedEvent, RecordingLogger, Sanitizer,
    CORRELATION_ID_HEADER,
};

/// Bodies above this size are logged by length only.
const MAX_LOGGED_BODY: usize = 10_000;

/// Records every outgoing GitHub API call and its response status.
pub struct RecordingMiddleware {
    logger: RecordingLogger,
}

impl RecordingMiddleware {
    pub fn new(logger: RecordingLogger) -> Self {
        Self { logger }
    }
}

#[async_trait::async_trait]
impl Middleware for RecordingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let correlation_id = correlation_id_for(&req, extensions);

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = correlation_id.parse() {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let request_data = RequestData::from_request(&req);
        let operation = format!("{} {}", request_data.method, extract_path(&request_data.url));
        self.record(
            &correlation_id,
            Direction::Request,
            operation,
            serde_json::to_value(&request_data).unwrap_or(serde_json::Value::Null),
        );

        let response = next.run(req, extensions).await;

        match &response {
            Ok(resp) => {
                let response_data = ResponseData::from_response(resp);
                self.record(
                    &correlation_id,
                    Direction::Response,
                    format!("response_{}", response_data.status_code),
                    serde_json::to_value(&response_data).unwrap_or(serde_json::Value::Null),
                );
            }
            Err(err) => {
                self.record(
                    &correlation_id,
                    Direction::Response,
                    "error",
                    serde_json::json!({ "error": err.to_string() }),
                );
            }
        }

        response
    }
}

impl RecordingMiddleware {
    fn record(
        &self,
        correlation_id: &str,
        direction: Direction,
        operation: impl Into<String>,
        data: serde_json::Value,
    ) {
        self.logger.record(RecordedEvent::now(
            correlation_id,
            EventType::GitHubApiCall,
            direction,
            operation,
            data,
        ));
    }
}

/// The header wins, then a request extension, then a fresh id.
fn correlation_id_for(req: &Request, extensions: &http::Extensions) -> String {
    if let Some(value) = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return value.to_string();
    }

    extensions
        .get::<CorrelationId>()
        .cloned()
        .unwrap_or_else(CorrelationId::generate)
        .0
}

fn header_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();
    Sanitizer::sanitize_headers(&headers)
}

#[derive(Debug, Serialize)]
struct RequestData {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: serde_json::Value,
}

impl RequestData {
    fn from_request(request: &Request) -> Self {
        let body = match request.body().map(|b| b.as_bytes()) {
            None => serde_json::Value::String("[NO_BODY]".to_string()),
            Some(None) => serde_json::Value::String("[STREAM_BODY]".to_string()),
            Some(Some(bytes)) if bytes.len() > MAX_LOGGED_BODY => {
                serde_json::Value::String(format!("[LARGE_BODY_{}b]", bytes.len()))
            }
            Some(Some(bytes)) => match serde_json::from_slice(bytes) {
                Ok(json) => Sanitizer::sanitize_json(&json),
                Err(_) => serde_json::Value::String(format!("[OPAQUE_BODY_{}b]", bytes.len())),
            },
        };

        Self {
            method: request.method().to_string(),
            url: request.url().to_string(),
            headers: header_map(request.headers()),
            body,
        }
    }
}

#[derive(Debug, Serialize)]
struct ResponseData {
    status_code: u16,
    headers: HashMap<String, String>,
    body_size: u64,
}

impl ResponseData {
    fn from_response(response: &Response) -> Self {
        Self {
            status_code: response.status().as_u16(),
            headers: header_map(response.headers()),
            body_size: response.content_length().unwrap_or(0),
        }
    }
}

fn extract_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_path_drops_host_and_query() {
        assert_eq!(
            extract_path("https://api.github.com/repos/o/r/issues?state=open&page=2"),
            "/repos/o/r/issues"
        );
        assert_eq!(extract_path("not a url"), "not a url");
    }

    #[test]
    fn test_request_data_redacts_authorization_and_token_fields() {
        let client = reqwest::Client::new();
        let request = client
            .post("https://api.github.com/repos/o/r/issues")
            .header("Authorization", "Bearer ghs_secret")
            .header(CORRELATION_ID_HEADER, "cid-1")
            .body(r#"{"title":"t","token":"ghs_secret"}"#)
            .build()
            .unwrap();

        let data = RequestData::from_request(&request);
        let serialized = serde_json::to_string(&data).unwrap();

        assert!(!serialized.contains("ghs_secret"));
        assert_eq!(data.method, "POST");
        assert_eq!(data.body["title"], "t");
        assert_eq!(correlation_id_for(&request, &http::Extensions::new()), "cid-1");
    }

    #[test]
    fn test_correlation_id_falls_back_to_extension() {
        let request = reqwest::Client::new()
            .get("https://api.github.com/")
            .build()
            .unwrap();
        let mut extensions = http::Extensions::new();
        extensions.insert(CorrelationId("from-extension".to_string()));

        assert_eq!(correlation_id_for(&request, &extensions), "from-extension");
    }
}
