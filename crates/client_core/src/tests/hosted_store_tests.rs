use super::*;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode as HttpStatus},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;

const ANON_KEY: &str = "anon-test-key";

#[test]
fn derives_rest_and_realtime_urls_from_the_project() {
    let store = HostedStore::new("https://demo.example.co/", ANON_KEY).expect("store");
    assert_eq!(store.rest_url.as_str(), "https://demo.example.co/rest/v1/");
    assert_eq!(store.realtime_url.scheme(), "wss");
    assert_eq!(store.realtime_url.path(), "/realtime/v1/websocket");
    let query: HashMap<_, _> = store.realtime_url.query_pairs().into_owned().collect();
    assert_eq!(query.get("apikey").map(String::as_str), Some(ANON_KEY));
    assert_eq!(query.get("vsn").map(String::as_str), Some("1.0.0"));

    let local = HostedStore::new("http://127.0.0.1:54321", ANON_KEY).expect("store");
    assert_eq!(local.realtime_url.scheme(), "ws");

    assert!(HostedStore::new("ftp://demo.example.co", ANON_KEY).is_err());
    assert!(HostedStore::new("not a url", ANON_KEY).is_err());
}

#[test]
fn filter_params_translate_to_postgrest_operators() {
    let filter = RowFilter::all()
        .eq("blood_type", "O-")
        .contains("location", "brook");
    assert_eq!(
        filter_params(&filter),
        vec![
            ("select".to_string(), "*".to_string()),
            ("blood_type".to_string(), "eq.O-".to_string()),
            ("location".to_string(), "ilike.*brook*".to_string()),
            ("order".to_string(), "created_at.desc".to_string()),
        ]
    );
}

#[test]
fn contains_filter_takes_the_needle_literally() {
    assert_eq!(contains_pattern("brook"), "*brook*");
    assert_eq!(contains_pattern("50%_off"), "*50\\%\\_off*");
    assert_eq!(contains_pattern("a*b"), "*a_b*");
    assert_eq!(
        contains_pattern("St. Mary (North)"),
        "\"*St. Mary (North)*\""
    );
    assert_eq!(contains_pattern("x,y\\z"), "\"*x,y\\\\\\\\z*\"");

    let filter = RowFilter::all().contains("location", "Ward 5, Bed (2)");
    assert_eq!(
        filter_params(&filter)[1],
        (
            "location".to_string(),
            "ilike.\"*Ward 5, Bed (2)*\"".to_string()
        )
    );
}

#[test]
fn parses_postgres_changes_frames() {
    let frame = json!({
        "topic": "realtime:public:donors",
        "event": "postgres_changes",
        "payload": {
            "ids": [1],
            "data": {
                "schema": "public",
                "table": "donors",
                "type": "UPDATE",
                "record": { "id": "d-1", "is_available": false },
                "old_record": { "id": "d-1" },
                "commit_timestamp": "2024-05-01T10:00:00Z",
            }
        },
        "ref": null,
    });
    let event = parse_realtime_frame(&frame.to_string()).expect("change");
    assert_eq!(event.table, Table::Donors);
    assert_eq!(event.kind, ChangeKind::Update);
    assert_eq!(event.new["is_available"], json!(false));
    assert_eq!(event.row_id(), Some("d-1"));
}

#[test]
fn parses_legacy_change_frames() {
    let frame = json!({
        "topic": "realtime:public:emergencies",
        "event": "INSERT",
        "payload": {
            "table": "emergencies",
            "type": "INSERT",
            "record": { "id": "e-1", "hospital": "General" },
        },
        "ref": null,
    });
    let event = parse_realtime_frame(&frame.to_string()).expect("change");
    assert_eq!(event.table, Table::Emergencies);
    assert_eq!(event.kind, ChangeKind::Insert);
    assert!(event.old.is_empty());

    let delete = json!({
        "event": "DELETE",
        "payload": { "table": "donors", "eventType": "DELETE", "old_record": { "id": "d-9" } },
    });
    let event = parse_realtime_frame(&delete.to_string()).expect("change");
    assert_eq!(event.kind, ChangeKind::Delete);
    assert_eq!(event.row_id(), Some("d-9"));
}

#[test]
fn ignores_control_traffic_and_unknown_tables() {
    let reply = json!({
        "topic": "phoenix",
        "event": "phx_reply",
        "payload": { "status": "ok", "response": {} },
        "ref": "2",
    });
    assert!(parse_realtime_frame(&reply.to_string()).is_none());
    assert!(parse_realtime_frame("not json").is_none());

    let other_table = json!({
        "event": "postgres_changes",
        "payload": { "data": { "table": "hospitals", "type": "INSERT", "record": {} } },
    });
    assert!(parse_realtime_frame(&other_table.to_string()).is_none());

    let truncate = json!({
        "event": "postgres_changes",
        "payload": { "data": { "table": "donors", "type": "TRUNCATE" } },
    });
    assert!(parse_realtime_frame(&truncate.to_string()).is_none());
}

#[test]
fn join_message_subscribes_to_every_event_of_the_table() {
    let join = join_message(Table::Donors);
    assert_eq!(join["event"], json!("phx_join"));
    assert_eq!(join["topic"], json!("realtime:public:donors"));
    assert_eq!(
        join["payload"]["config"]["postgres_changes"][0],
        json!({ "event": "*", "schema": "public", "table": "donors" })
    );
}

#[test]
fn http_statuses_map_to_error_codes() {
    assert_eq!(status_code(StatusCode::UNAUTHORIZED), ErrorCode::Unauthorized);
    assert_eq!(status_code(StatusCode::NOT_FOUND), ErrorCode::NotFound);
    assert_eq!(status_code(StatusCode::CONFLICT), ErrorCode::Conflict);
    assert_eq!(status_code(StatusCode::BAD_REQUEST), ErrorCode::Validation);
    assert_eq!(status_code(StatusCode::BAD_GATEWAY), ErrorCode::Unavailable);
    assert_eq!(
        status_code(StatusCode::INTERNAL_SERVER_ERROR),
        ErrorCode::Internal
    );
}

#[derive(Clone, Default)]
struct FakeRest {
    seen: Arc<Mutex<Vec<(String, HashMap<String, String>)>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    let key = headers.get("apikey").and_then(|value| value.to_str().ok());
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok());
    key == Some(ANON_KEY) && bearer == Some(format!("Bearer {ANON_KEY}").as_str())
}

async fn list_donors(
    State(rest): State<FakeRest>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, HttpStatus> {
    if !authorized(&headers) {
        return Err(HttpStatus::UNAUTHORIZED);
    }
    rest.seen
        .lock()
        .expect("seen")
        .push(("GET".into(), params));
    Ok(Json(json!([
        { "id": "d-1", "name": "Jane", "blood_type": "O-" }
    ])))
}

async fn insert_donor(
    State(rest): State<FakeRest>,
    headers: HeaderMap,
    Json(rows): Json<Vec<Value>>,
) -> Result<(HttpStatus, Json<Value>), HttpStatus> {
    if !authorized(&headers) {
        return Err(HttpStatus::UNAUTHORIZED);
    }
    let prefer = headers
        .get("prefer")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    rest.seen
        .lock()
        .expect("seen")
        .push(("POST".into(), HashMap::from([("prefer".to_string(), prefer)])));
    let mut row = rows.into_iter().next().unwrap_or_default();
    row["id"] = json!("d-2");
    Ok((HttpStatus::CREATED, Json(json!([row]))))
}

async fn update_donor(
    Query(params): Query<HashMap<String, String>>,
) -> (HttpStatus, Json<Value>) {
    let id = params.get("id").cloned().unwrap_or_default();
    (
        HttpStatus::CONFLICT,
        Json(json!({ "code": "23505", "message": format!("row {id} is locked") })),
    )
}

async fn delete_donor() -> HttpStatus {
    HttpStatus::BAD_GATEWAY
}

async fn serve_rest() -> (HostedStore, FakeRest) {
    let rest = FakeRest::default();
    let app = Router::new()
        .route(
            "/rest/v1/donors",
            get(list_donors)
                .post(insert_donor)
                .patch(update_donor)
                .delete(delete_donor),
        )
        .with_state(rest.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    let store = HostedStore::new(&format!("http://{addr}"), ANON_KEY).expect("store");
    (store, rest)
}

#[tokio::test]
async fn query_sends_filters_and_credentials() {
    let (store, rest) = serve_rest().await;
    let rows = store
        .query(Table::Donors, &RowFilter::all().eq("blood_type", "O-"))
        .await
        .expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("Jane"));

    let seen = rest.seen.lock().expect("seen").clone();
    let (method, params) = &seen[0];
    assert_eq!(method, "GET");
    assert_eq!(params.get("blood_type").map(String::as_str), Some("eq.O-"));
    assert_eq!(
        params.get("order").map(String::as_str),
        Some("created_at.desc")
    );
}

#[tokio::test]
async fn insert_returns_the_stored_row() {
    let (store, rest) = serve_rest().await;
    let mut record = Record::new();
    record.insert("name".into(), json!("Ben"));
    let stored = store.insert(Table::Donors, record).await.expect("insert");
    assert_eq!(stored["id"], json!("d-2"));
    assert_eq!(stored["name"], json!("Ben"));

    let seen = rest.seen.lock().expect("seen").clone();
    assert_eq!(
        seen[0].1.get("prefer").map(String::as_str),
        Some("return=representation")
    );
}

#[tokio::test]
async fn store_errors_carry_code_and_message() {
    let (store, _rest) = serve_rest().await;
    let mut fields = Record::new();
    fields.insert("is_available".into(), json!(false));
    let err = store
        .update(Table::Donors, "d-1", fields)
        .await
        .expect_err("conflict");
    assert_eq!(err.code, ErrorCode::Conflict);
    assert_eq!(err.message, "row eq.d-1 is locked");

    let err = store
        .delete(Table::Donors, "d-1")
        .await
        .expect_err("gateway");
    assert_eq!(err.code, ErrorCode::Unavailable);

    let err = store
        .update(Table::Donors, "d-1", Record::new())
        .await
        .expect_err("empty update");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = store
        .query(Table::Emergencies, &RowFilter::all())
        .await
        .expect_err("no such route");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn unreachable_store_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let store = HostedStore::new(&format!("http://{addr}"), ANON_KEY).expect("store");
    let err = store
        .query(Table::Donors, &RowFilter::all())
        .await
        .expect_err("refused");
    assert_eq!(err.code, ErrorCode::Unavailable);
}

#[tokio::test]
async fn subscription_joins_and_forwards_table_changes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut socket = tokio_tungstenite::accept_async(stream)
            .await
            .expect("handshake");
        let Some(Ok(Message::Text(join))) = socket.next().await else {
            panic!("expected join frame");
        };
        let join: Value = serde_json::from_str(&join).expect("join json");

        let reply = json!({
            "topic": join["topic"],
            "event": "phx_reply",
            "payload": { "status": "ok", "response": {} },
            "ref": "1",
        });
        let foreign = json!({
            "event": "postgres_changes",
            "payload": { "data": { "table": "emergencies", "type": "INSERT", "record": { "id": "e-1" } } },
        });
        let change = json!({
            "event": "postgres_changes",
            "payload": { "data": { "table": "donors", "type": "INSERT", "record": { "id": "d-7" } } },
        });
        for frame in [reply, foreign, change] {
            socket
                .send(Message::Text(frame.to_string()))
                .await
                .expect("send frame");
        }
        // Keep the socket open until the client goes away.
        while let Some(Ok(_)) = socket.next().await {}
        join
    });

    let store = HostedStore::new(&format!("http://{addr}"), ANON_KEY).expect("store");
    let mut subscription = store
        .subscribe_table(Table::Donors)
        .await
        .expect("subscribe");
    let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("change in time")
        .expect("change");
    assert_eq!(event.table, Table::Donors);
    assert_eq!(event.kind, ChangeKind::Insert);
    assert_eq!(event.row_id(), Some("d-7"));
    assert!(subscription.try_next().is_none());

    store.unsubscribe(subscription);
    let join = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server finished")
        .expect("server task");
    assert_eq!(join["topic"], json!("realtime:public:donors"));
}
