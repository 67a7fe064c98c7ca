//! [`RealtimeStore`] backed by a hosted Postgres project: PostgREST for rows
//! and the Phoenix realtime socket for change events.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use realtime_store::{
    ChangeBroker, ChangeEvent, RealtimeStore, Record, RowFilter, SortOrder, Subscription, Table,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{
    domain::ChangeKind,
    error::{ApiException, ErrorCode},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

pub struct HostedStore {
    http: Client,
    rest_url: Url,
    realtime_url: Url,
    anon_key: String,
}

impl HostedStore {
    pub fn new(project_url: &str, anon_key: &str) -> anyhow::Result<Self> {
        let base = Url::parse(project_url.trim_end_matches('/'))
            .with_context(|| format!("invalid project url: {project_url}"))?;
        let rest_url = base
            .join("/rest/v1/")
            .context("failed to build REST url")?;
        let mut realtime_url = base
            .join("/realtime/v1/websocket")
            .context("failed to build realtime url")?;
        let scheme = match base.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("unsupported project url scheme: {other}")),
        };
        realtime_url
            .set_scheme(scheme)
            .map_err(|_| anyhow!("failed to set realtime url scheme"))?;
        realtime_url
            .query_pairs_mut()
            .append_pair("apikey", anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(Self {
            http: Client::new(),
            rest_url,
            realtime_url,
            anon_key: anon_key.to_string(),
        })
    }

    fn table_url(&self, table: Table) -> Result<Url, ApiException> {
        self.rest_url
            .join(table.as_str())
            .map_err(|err| ApiException::internal(format!("invalid table url: {err}")))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
    }
}

/// PostgREST query parameters for `filter`.
pub fn filter_params(filter: &RowFilter) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for (column, value) in &filter.equals {
        params.push((column.clone(), format!("eq.{}", plain_value(value))));
    }
    for (column, needle) in &filter.contains_ci {
        params.push((column.clone(), format!("ilike.{}", contains_pattern(needle))));
    }
    let order = match filter.order {
        SortOrder::NewestFirst => "created_at.desc",
        SortOrder::OldestFirst => "created_at.asc",
    };
    params.push(("order".to_string(), order.to_string()));
    params
}

/// `ilike` operand matching `needle` anywhere, case-insensitively, with the
/// needle taken literally. PostgREST turns every `*` into `%`, so a literal
/// `*` becomes the single-character wildcard `_`. Operands holding reserved
/// characters are double-quoted.
pub fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::from("*");
    for ch in needle.chars() {
        match ch {
            '\\' | '%' | '_' => {
                pattern.push('\\');
                pattern.push(ch);
            }
            '*' => pattern.push('_'),
            _ => pattern.push(ch),
        }
    }
    pattern.push('*');
    if pattern.contains([',', '.', ':', '(', ')', '"']) {
        let quoted = pattern.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{quoted}\"")
    } else {
        pattern
    }
}

fn plain_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Deserialize)]
struct PostgrestError {
    #[serde(default)]
    message: Option<String>,
}

fn status_code(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorCode::Unauthorized,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::Conflict,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::Validation,
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            ErrorCode::Unavailable
        }
        _ => ErrorCode::Internal,
    }
}

async fn send(request: RequestBuilder) -> Result<Response, ApiException> {
    let response = request
        .send()
        .await
        .map_err(|err| ApiException::unavailable(format!("store request failed: {err}")))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<PostgrestError>(&body)
        .ok()
        .and_then(|err| err.message)
        .unwrap_or_else(|| format!("store responded with {status}"));
    Err(ApiException::new(status_code(status), message))
}

#[async_trait]
impl RealtimeStore for HostedStore {
    async fn query(&self, table: Table, filter: &RowFilter) -> Result<Vec<Record>, ApiException> {
        let request = self
            .authorized(self.http.get(self.table_url(table)?))
            .query(&filter_params(filter));
        send(request)
            .await?
            .json::<Vec<Record>>()
            .await
            .map_err(|err| ApiException::internal(format!("invalid rows from store: {err}")))
    }

    async fn insert(&self, table: Table, record: Record) -> Result<Record, ApiException> {
        let request = self
            .authorized(self.http.post(self.table_url(table)?))
            .header("Prefer", "return=representation")
            .json(&vec![record]);
        let mut rows = send(request)
            .await?
            .json::<Vec<Record>>()
            .await
            .map_err(|err| ApiException::internal(format!("invalid rows from store: {err}")))?;
        if rows.is_empty() {
            return Err(ApiException::internal("store returned no inserted row"));
        }
        Ok(rows.swap_remove(0))
    }

    async fn update(&self, table: Table, id: &str, fields: Record) -> Result<(), ApiException> {
        if fields.is_empty() {
            return Err(ApiException::validation("update carries no columns"));
        }
        let request = self
            .authorized(self.http.patch(self.table_url(table)?))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(&fields);
        send(request).await.map(|_| ())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), ApiException> {
        let request = self
            .authorized(self.http.delete(self.table_url(table)?))
            .query(&[("id", format!("eq.{id}"))]);
        send(request).await.map(|_| ())
    }

    async fn subscribe_table(&self, table: Table) -> Result<Subscription, ApiException> {
        let (ws_stream, _) = connect_async(self.realtime_url.as_str())
            .await
            .map_err(|err| {
                ApiException::unavailable(format!("failed to open realtime socket: {err}"))
            })?;
        let (mut writer, mut reader) = ws_stream.split();

        let join = join_message(table);
        writer
            .send(Message::Text(join.to_string()))
            .await
            .map_err(|err| ApiException::unavailable(format!("failed to join {table}: {err}")))?;
        info!(%table, "realtime: joined change channel");

        let broker = ChangeBroker::new();
        let mut subscription = broker.subscribe(table);

        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            let mut sequence = 1u64;
            loop {
                interval.tick().await;
                sequence += 1;
                let frame = json!({
                    "topic": "phoenix",
                    "event": "heartbeat",
                    "payload": {},
                    "ref": sequence.to_string(),
                });
                if writer.send(Message::Text(frame.to_string())).await.is_err() {
                    debug!("realtime: heartbeat writer closed");
                    break;
                }
            }
        });

        let feed = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_realtime_frame(&text) {
                            if event.table == table {
                                broker.publish(&event);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%table, "realtime: change socket failed: {err}");
                        break;
                    }
                }
            }
            debug!(%table, "realtime: change socket closed");
        });

        subscription.attach_task(heartbeat.abort_handle());
        subscription.attach_task(feed.abort_handle());
        Ok(subscription)
    }
}

fn join_message(table: Table) -> Value {
    json!({
        "topic": format!("realtime:public:{table}"),
        "event": "phx_join",
        "payload": {
            "config": {
                "postgres_changes": [
                    { "event": "*", "schema": "public", "table": table.as_str() }
                ]
            }
        },
        "ref": "1",
    })
}

#[derive(Deserialize)]
struct PhoenixFrame {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct ChangePayload {
    table: String,
    #[serde(rename = "type", alias = "eventType")]
    kind: String,
    #[serde(default)]
    record: Option<Record>,
    #[serde(default)]
    old_record: Option<Record>,
}

/// Extracts a row change from one realtime socket frame. Replies,
/// heartbeats and presence traffic yield `None`.
pub fn parse_realtime_frame(text: &str) -> Option<ChangeEvent> {
    let frame: PhoenixFrame = serde_json::from_str(text).ok()?;
    let payload = match frame.event.as_str() {
        "postgres_changes" => frame.payload.get("data")?.clone(),
        "INSERT" | "UPDATE" | "DELETE" => frame.payload,
        _ => return None,
    };
    let change: ChangePayload = match serde_json::from_value(payload) {
        Ok(change) => change,
        Err(err) => {
            warn!("realtime: malformed change payload: {err}");
            return None;
        }
    };
    let table = Table::from_name(&change.table)?;
    let kind = match change.kind.as_str() {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    Some(ChangeEvent {
        table,
        kind,
        new: change.record.unwrap_or_default(),
        old: change.old_record.unwrap_or_default(),
    })
}

#[cfg(test)]
#[path = "tests/hosted_store_tests.rs"]
mod tests;
