//! Thin async client for the turnstiled HTTP API.

use anyhow::{bail, Context, Result};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const MATCH_TIMEOUT: Duration = Duration::from_secs(20);
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct BestMatch {
    pub name: String,
    pub score: f64,
    #[serde(rename = "match")]
    pub is_match: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchReply {
    pub scores: BTreeMap<String, f64>,
    pub best: BestMatch,
    pub thr: f64,
    pub logged: bool,
}

#[derive(Serialize)]
struct EventBody<'a> {
    person: &'a str,
    score: f64,
    camera: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<&'a str>,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("turnstile-cli/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> Result<Value> {
        let resp = self.http.get(self.url("/health")).send().await?;
        json_body(resp).await
    }

    /// Upload `files` as `(filename, bytes)` pairs for `name`.
    pub async fn enroll(&self, name: &str, files: Vec<(String, Vec<u8>)>) -> Result<Value> {
        let mut form = multipart::Form::new().text("name", name.to_string());
        for (filename, bytes) in files {
            form = form.part("files", multipart::Part::bytes(bytes).file_name(filename));
        }
        let resp = self
            .http
            .post(self.url("/enroll"))
            .multipart(form)
            .send()
            .await?;
        json_body(resp).await
    }

    pub async fn match_image(&self, image: Vec<u8>, thr: f32, camera: &str) -> Result<MatchReply> {
        let part = multipart::Part::bytes(image)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = multipart::Form::new().part("file", part);
        let resp = self
            .http
            .post(self.url("/match"))
            .query(&[("thr", thr.to_string()), ("camera", camera.to_string())])
            .multipart(form)
            .timeout(MATCH_TIMEOUT)
            .send()
            .await?;
        let body = json_body(resp).await?;
        serde_json::from_value(body).context("unexpected /match response")
    }

    pub async fn post_event(
        &self,
        person: &str,
        score: f64,
        camera: &str,
        timestamp: Option<&str>,
    ) -> Result<Value> {
        let resp = self
            .http
            .post(self.url("/events"))
            .json(&EventBody {
                person,
                score,
                camera,
                timestamp,
            })
            .timeout(EVENT_TIMEOUT)
            .send()
            .await?;
        json_body(resp).await
    }

    pub async fn events(&self) -> Result<Value> {
        let resp = self.http.get(self.url("/events")).send().await?;
        json_body(resp).await
    }

    pub async fn clear_events(&self) -> Result<Value> {
        let resp = self.http.post(self.url("/events/clear")).send().await?;
        json_body(resp).await
    }

    pub async fn export_csv(&self) -> Result<Vec<u8>> {
        let resp = self.http.get(self.url("/events/csv")).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if !status.is_success() {
            bail!("{status}: {}", String::from_utf8_lossy(&body));
        }
        Ok(body.to_vec())
    }
}

/// Parse a JSON response, turning non-2xx statuses into errors that carry
/// the server's reason.
async fn json_body(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body = resp.bytes().await?;
    if !status.is_success() {
        let reason = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
        bail!("{status}: {reason}");
    }
    serde_json::from_slice(&body).context("response was not JSON")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = ApiClient::new("http://127.0.0.1:8000/").unwrap();
        assert_eq!(client.url("/match"), "http://127.0.0.1:8000/match");
    }

    #[test]
    fn test_match_reply_parses_server_shape() {
        let raw = serde_json::json!({
            "scores": { "alice": 0.912 },
            "best": { "name": "alice", "score": 0.912, "match": true },
            "thr": 0.45,
            "logged": false
        });
        let reply: MatchReply = serde_json::from_value(raw).unwrap();
        assert!(reply.best.is_match);
        assert_eq!(reply.scores["alice"], 0.912);
    }

    #[test]
    fn test_event_body_omits_missing_timestamp() {
        let body = EventBody {
            person: "unknown",
            score: 0.3,
            camera: "simulator-1",
            timestamp: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({ "person": "unknown", "score": 0.3, "camera": "simulator-1" })
        );
    }
}
