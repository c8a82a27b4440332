//! etcd v3 client speaking the JSON gateway.
//!
//! Keys and values travel base64-encoded and 64-bit integers may arrive as
//! JSON strings. Watches are long-lived POSTs whose body is a sequence of
//! newline-delimited JSON messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use crate::error::{RegistryError, Result};
use crate::store::{CoordinationStore, KeyValue, LeaseId, PrefixSnapshot, WatchEvent, WatchStream};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// gRPC status code etcd uses for missing leases and keys.
const GRPC_NOT_FOUND: i32 = 5;

pub struct EtcdGatewayStore {
    http: reqwest::Client,
    base: Url,
    endpoint: String,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl EtcdGatewayStore {
    /// Connects to `endpoint` (`host:port` or a full URL) and checks the
    /// member is answering within `dial_timeout`.
    pub async fn connect(endpoint: &str, dial_timeout: Duration) -> Result<Self> {
        let normalized = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };
        let base = Url::parse(&normalized).map_err(|err| {
            RegistryError::InvalidConfig(format!("invalid etcd endpoint {endpoint}: {err}"))
        })?;
        let http = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .build()
            .map_err(|err| RegistryError::from_http(endpoint, err))?;

        let store = Self {
            http,
            base,
            endpoint: endpoint.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT.max(dial_timeout),
            closed: AtomicBool::new(false),
        };

        store
            .call::<serde_json::Value>("/v3/maintenance/status", &json!({}), dial_timeout)
            .await
            .map_err(|err| match err {
                RegistryError::Timeout(_) => RegistryError::Unreachable {
                    endpoint: endpoint.to_string(),
                    reason: format!("no answer within {}s", dial_timeout.as_secs_f32()),
                },
                other => other,
            })?;

        info!(endpoint, "connected to coordination store");
        Ok(store)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|err| RegistryError::InvalidConfig(format!("invalid etcd path {path}: {err}")))
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        self.ensure_open()?;
        let mut request = self.http.post(self.url(path)?).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|err| RegistryError::from_http(&self.endpoint, err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error = response.json::<GatewayError>().await.unwrap_or_default();
        Err(RegistryError::Rejected {
            code: error.code,
            message: error
                .message
                .or(error.error)
                .unwrap_or_else(|| status.to_string()),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let response = self.send(path, body, Some(timeout)).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| RegistryError::Protocol(format!("{path}: {err}")))
    }
}

#[async_trait]
impl CoordinationStore for EtcdGatewayStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        // etcd leases have whole-second granularity
        let ttl_secs = ttl.as_secs().max(1);
        let response: LeaseGrantResponse = self
            .call(
                "/v3/lease/grant",
                &json!({ "TTL": ttl_secs.to_string(), "ID": "0" }),
                self.request_timeout,
            )
            .await?;
        if !response.error.is_empty() {
            return Err(RegistryError::Rejected {
                code: 0,
                message: response.error,
            });
        }
        if response.id == 0 {
            return Err(RegistryError::Protocol("lease grant returned no id".into()));
        }
        debug!(lease = response.id, ttl = response.ttl, "lease granted");
        Ok(response.id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Option<Duration>> {
        let result = self
            .call::<KeepAliveMessage>(
                "/v3/lease/keepalive",
                &json!({ "ID": lease.to_string() }),
                self.request_timeout,
            )
            .await;
        let message = match result {
            Ok(message) => message,
            Err(RegistryError::Rejected { code, .. }) if code == GRPC_NOT_FOUND => return Ok(None),
            Err(err) => return Err(err),
        };

        if let Some(error) = message.error {
            if error.grpc_code == GRPC_NOT_FOUND {
                return Ok(None);
            }
            return Err(RegistryError::Rejected {
                code: error.grpc_code,
                message: error.message,
            });
        }
        match message.result {
            Some(result) if result.ttl > 0 => Ok(Some(Duration::from_secs(result.ttl as u64))),
            _ => Ok(None),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.call::<serde_json::Value>(
            "/v3/lease/revoke",
            &json!({ "ID": lease.to_string() }),
            self.request_timeout,
        )
        .await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut body = json!({
            "key": BASE64.encode(key),
            "value": BASE64.encode(value),
        });
        if let Some(lease) = lease {
            body["lease"] = json!(lease.to_string());
        }
        self.call::<serde_json::Value>("/v3/kv/put", &body, self.request_timeout)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let response: DeleteRangeResponse = self
            .call(
                "/v3/kv/deleterange",
                &json!({ "key": BASE64.encode(key) }),
                self.request_timeout,
            )
            .await?;
        Ok(response.deleted > 0)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot> {
        let (key, range_end) = prefix_range(prefix);
        let response: RangeResponse = self
            .call(
                "/v3/kv/range",
                &json!({ "key": key, "range_end": range_end }),
                self.request_timeout,
            )
            .await?;
        let kvs = response
            .kvs
            .iter()
            .map(RawKeyValue::decode)
            .collect::<Result<Vec<_>>>()?;
        Ok(PrefixSnapshot {
            revision: response.header.revision,
            kvs,
        })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let (key, range_end) = prefix_range(prefix);
        let body = json!({
            "create_request": {
                "key": key,
                "range_end": range_end,
                "start_revision": start_revision.to_string(),
            }
        });
        // no deadline: the response body is the subscription
        let response = self.send("/v3/watch", &body, None).await?;
        debug!(prefix, start_revision, "watch established");
        Ok(decode_watch_stream(
            response.bytes_stream().boxed(),
            self.endpoint.clone(),
        ))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(endpoint = %self.endpoint, "coordination store client closed");
        }
    }
}

/// Range bounds covering every key that starts with `prefix`, base64-encoded.
fn prefix_range(prefix: &str) -> (String, String) {
    if prefix.is_empty() {
        // key "\0" with range_end "\0" selects the whole keyspace
        let all = BASE64.encode([0u8]);
        return (all.clone(), all);
    }
    (
        BASE64.encode(prefix),
        BASE64.encode(range_end(prefix.as_bytes())),
    )
}

/// etcd's prefix rule: increment the last byte below 0xff and cut after it.
pub(crate) fn range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

fn decode_text(field: &str, encoded: &str) -> Result<String> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|err| RegistryError::Protocol(format!("{field} is not base64: {err}")))?;
    String::from_utf8(raw).map_err(|_| RegistryError::Protocol(format!("{field} is not utf-8")))
}

fn decode_watch_stream(chunks: BoxStream<'static, reqwest::Result<Bytes>>, endpoint: String) -> WatchStream {
    futures::stream::unfold(
        (chunks, Vec::<u8>::new(), false),
        move |(mut chunks, mut buffer, finished)| {
            let endpoint = endpoint.clone();
            async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(newline) = buffer.iter().position(|byte| *byte == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=newline).collect();
                        match parse_watch_line(&line) {
                            Ok(None) => continue,
                            Ok(Some(events)) => return Some((Ok(events), (chunks, buffer, false))),
                            Err(err) => return Some((Err(err), (chunks, buffer, true))),
                        }
                    }
                    match chunks.next().await {
                        Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                        Some(Err(err)) => {
                            let err = RegistryError::from_http(&endpoint, err);
                            return Some((Err(err), (chunks, buffer, true)));
                        }
                        None => {
                            let line = std::mem::take(&mut buffer);
                            return match parse_watch_line(&line) {
                                Ok(Some(events)) => Some((Ok(events), (chunks, buffer, true))),
                                Ok(None) => None,
                                Err(err) => Some((Err(err), (chunks, buffer, true))),
                            };
                        }
                    }
                }
            }
        },
    )
    .boxed()
}

/// Decodes one watch message. Progress and creation notices yield `None`.
fn parse_watch_line(line: &[u8]) -> Result<Option<Vec<WatchEvent>>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let message: WatchMessage = serde_json::from_str(text)
        .map_err(|err| RegistryError::Protocol(format!("watch message: {err}")))?;

    if let Some(error) = message.error {
        return Err(RegistryError::Rejected {
            code: error.grpc_code,
            message: error.message,
        });
    }
    let Some(result) = message.result else {
        return Ok(None);
    };
    if result.canceled {
        return Err(RegistryError::Rejected {
            code: 0,
            message: format!("watch canceled: {}", result.cancel_reason),
        });
    }
    if result.events.is_empty() {
        return Ok(None);
    }

    let events = result
        .events
        .iter()
        .map(|event| -> Result<WatchEvent> {
            let key = decode_text("key", &event.kv.key)?;
            Ok(if event.kind == "DELETE" {
                WatchEvent::Delete { key }
            } else {
                WatchEvent::Put(KeyValue {
                    key,
                    value: decode_text("value", &event.kv.value)?,
                })
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(events))
}

/// Accepts int64 fields encoded either as JSON numbers or strings.
fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }
    match Int64::deserialize(deserializer)? {
        Int64::Number(value) => Ok(value),
        Int64::Text(text) => text.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
struct GatewayError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    grpc_code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseHeader {
    #[serde(default, deserialize_with = "int64")]
    revision: i64,
}

#[derive(Debug, Deserialize)]
struct RawKeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

impl RawKeyValue {
    fn decode(&self) -> Result<KeyValue> {
        Ok(KeyValue {
            key: decode_text("key", &self.key)?,
            value: decode_text("value", &self.value)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    header: ResponseHeader,
    #[serde(default)]
    kvs: Vec<RawKeyValue>,
}

#[derive(Debug, Deserialize)]
struct DeleteRangeResponse {
    #[serde(default, deserialize_with = "int64")]
    deleted: i64,
}

#[derive(Debug, Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "int64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
}

#[derive(Debug, Deserialize)]
struct KeepAliveMessage {
    #[serde(default)]
    result: Option<KeepAliveResult>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    /// Omitted for PUT, the zero value of the enum.
    #[serde(rename = "type", default)]
    kind: String,
    kv: RawKeyValue,
}

#[derive(Debug, Deserialize)]
struct WatchResult {
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    cancel_reason: String,
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct WatchMessage {
    #[serde(default)]
    result: Option<WatchResult>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_end_increments_last_byte() {
        assert_eq!(range_end(b"nodes/"), b"nodes0".to_vec());
        assert_eq!(range_end(b"a\xff"), b"b".to_vec());
        assert_eq!(range_end(b"\xff\xff"), vec![0]);
    }

    #[test]
    fn empty_prefix_covers_keyspace() {
        let (key, end) = prefix_range("");
        assert_eq!(key, "AA==");
        assert_eq!(end, "AA==");
    }

    #[test]
    fn watch_line_with_put_and_delete() {
        let line = format!(
            r#"{{"result":{{"header":{{"revision":"7"}},"events":[{{"kv":{{"key":"{}","value":"{}","mod_revision":"6"}}}},{{"type":"DELETE","kv":{{"key":"{}","mod_revision":"7"}}}}]}}}}"#,
            BASE64.encode("n1"),
            BASE64.encode("10.0.0.1:9000"),
            BASE64.encode("n2"),
        );
        let events = parse_watch_line(line.as_bytes()).unwrap().unwrap();
        assert_eq!(
            events,
            vec![
                WatchEvent::Put(KeyValue::new("n1", "10.0.0.1:9000")),
                WatchEvent::Delete { key: "n2".into() },
            ]
        );
    }

    #[test]
    fn creation_notice_carries_no_events() {
        let line = br#"{"result":{"header":{"revision":"3"},"created":true}}"#;
        assert_eq!(parse_watch_line(line).unwrap(), None);
        assert_eq!(parse_watch_line(b"   \n").unwrap(), None);
    }

    #[test]
    fn canceled_watch_is_an_error() {
        let line = br#"{"result":{"canceled":true,"cancel_reason":"mvcc: required revision has been compacted"}}"#;
        let err = parse_watch_line(line).unwrap_err();
        assert!(err.to_string().contains("compacted"));
    }

    #[test]
    fn int64_accepts_strings_and_numbers() {
        let parsed: LeaseGrantResponse =
            serde_json::from_str(r#"{"ID":"7587862072903184399","TTL":10}"#).unwrap();
        assert_eq!(parsed.id, 7_587_862_072_903_184_399);
        assert_eq!(parsed.ttl, 10);

        assert!(serde_json::from_str::<LeaseGrantResponse>(r#"{"ID":"abc"}"#).is_err());
    }
}
