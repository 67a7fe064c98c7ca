use super::*;
use std::time::Duration;

use realtime_store::MissingRealtimeStore;
use serde_json::json;
use shared::{
    domain::{StockStatus, Urgency},
    protocol::{ToolCall, TOOL_CHECK_INVENTORY, TOOL_REGISTER_DONOR},
};
use storage::Storage;
use tokio::time::timeout;

async fn storage() -> Arc<Storage> {
    Arc::new(Storage::new("sqlite::memory:").await.expect("db"))
}

fn new_donor(name: &str, blood_type: BloodType, location: &str) -> NewDonor {
    NewDonor {
        name: name.into(),
        blood_type,
        last_donation_date: None,
        contact: "555-0100".into(),
        location: location.into(),
        is_available: true,
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    wanted: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("client event");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

fn donors_changed(kind: ChangeKind) -> impl Fn(&ClientEvent) -> bool {
    move |event| matches!(event, ClientEvent::DonorsChanged { kind: seen, .. } if *seen == kind)
}

#[tokio::test]
async fn start_loads_existing_donors_newest_first() {
    let store = storage().await;
    for name in ["older", "newer"] {
        store
            .insert(
                Table::Donors,
                normalize::new_donor_to_record(&new_donor(name, BloodType::APositive, "Queens")),
            )
            .await
            .expect("seed");
    }

    let client = HemoClient::new(store.clone());
    client.start().await.expect("start");

    let names: Vec<_> = client
        .donors()
        .await
        .into_iter()
        .map(|donor| donor.name)
        .collect();
    assert_eq!(names, vec!["newer", "older"]);
    assert!(!client.is_loading().await);
    assert!(client.is_live().await);
    client.stop().await;
}

#[tokio::test]
async fn donors_change_only_through_the_feed() {
    let store = storage().await;
    let client = HemoClient::new(store.clone());

    client
        .add_donor(new_donor("Jane", BloodType::ONegative, "Brooklyn"))
        .await
        .expect("add donor");
    assert!(client.donors().await.is_empty());
    assert_eq!(store.count_rows(Table::Donors).await.expect("count"), 1);
}

#[tokio::test]
async fn live_feed_applies_crud_round_trips() {
    let store = storage().await;
    let client = HemoClient::new(store.clone());
    let mut events = client.subscribe_events();
    client.start().await.expect("start");

    client
        .add_donor(new_donor("Jane", BloodType::ONegative, "Brooklyn"))
        .await
        .expect("add donor");
    next_event(&mut events, donors_changed(ChangeKind::Insert)).await;

    let jane = client.donors().await.remove(0);
    assert_eq!(jane.last_donation_date, Some(Utc::now().date_naive()));
    assert_eq!(client.inventory().await[7].units, 1);
    assert_eq!(client.activity().await[0].message, "New donor Jane registered.");

    client.toggle_availability(jane.id).await.expect("toggle");
    next_event(&mut events, donors_changed(ChangeKind::Update)).await;
    let toggled = client.donors().await.remove(0);
    assert!(!toggled.is_available);
    assert_eq!(client.inventory().await[7].status, StockStatus::Critical);

    client.notify_donor(jane.id).await.expect("notify");
    next_event(&mut events, donors_changed(ChangeKind::Update)).await;
    assert!(client.donors().await[0].last_notified.is_some());

    client.delete_donor(jane.id).await.expect("delete");
    next_event(&mut events, donors_changed(ChangeKind::Delete)).await;
    assert!(client.donors().await.is_empty());

    let feed: Vec<_> = client
        .activity()
        .await
        .into_iter()
        .map(|entry| entry.message)
        .collect();
    assert_eq!(
        feed,
        vec![
            "Donor removed from system.",
            "Updated status for Jane.",
            "Updated status for Jane.",
            "New donor Jane registered.",
        ]
    );
    client.stop().await;
}

#[tokio::test]
async fn failed_action_raises_database_alert_and_clears_syncing() {
    let client = HemoClient::new(Arc::new(MissingRealtimeStore));
    let mut events = client.subscribe_events();

    let err = client
        .add_donor(new_donor("Jane", BloodType::OPositive, "Queens"))
        .await
        .expect_err("store is missing");
    assert_eq!(err.code, ErrorCode::Unavailable);
    assert!(!client.is_syncing().await);

    assert_eq!(
        events.recv().await.expect("event"),
        ClientEvent::SyncingChanged(true)
    );
    assert_eq!(
        events.recv().await.expect("event"),
        ClientEvent::SyncingChanged(false)
    );
    let ClientEvent::Alert(message) = events.recv().await.expect("event") else {
        panic!("expected alert");
    };
    assert!(message.starts_with("Database Error: "));
    assert!(client.donors().await.is_empty());
}

#[tokio::test]
async fn toggle_of_unlisted_donor_alerts() {
    let client = HemoClient::new(storage().await);
    let mut events = client.subscribe_events();
    let err = client
        .toggle_availability(DonorId::new())
        .await
        .expect_err("not listed");
    assert_eq!(err.code, ErrorCode::NotFound);
    assert!(matches!(
        events.recv().await.expect("event"),
        ClientEvent::Alert(_)
    ));
}

#[tokio::test]
async fn emergency_broadcast_raises_alert_from_insert_event() {
    let store = storage().await;
    let client = HemoClient::new(store.clone());
    let mut events = client.subscribe_events();
    client.start().await.expect("start");

    client
        .broadcast_emergency(NewEmergency {
            blood_type: BloodType::ONegative,
            hospital: "St. Mary".into(),
            units_needed: 4,
            urgency: Urgency::Critical,
        })
        .await
        .expect("broadcast");
    let ClientEvent::EmergencyRaised(emergency) = next_event(&mut events, |event| {
        matches!(event, ClientEvent::EmergencyRaised(_))
    })
    .await
    else {
        unreachable!();
    };
    assert_eq!(emergency.hospital, "St. Mary");
    assert_eq!(client.active_emergency().await, Some(emergency));

    client.dismiss_emergency().await;
    assert_eq!(client.active_emergency().await, None);
    client.stop().await;
}

#[tokio::test]
async fn emergency_with_no_units_is_rejected() {
    let store = storage().await;
    let client = HemoClient::new(store.clone());
    let err = client
        .broadcast_emergency(NewEmergency {
            blood_type: BloodType::APositive,
            hospital: "General".into(),
            units_needed: 0,
            urgency: Urgency::High,
        })
        .await
        .expect_err("rejected");
    assert_eq!(err.code, ErrorCode::Validation);
    assert_eq!(store.count_rows(Table::Emergencies).await.expect("count"), 0);
}

#[tokio::test(start_paused = true)]
async fn emergency_alert_clears_after_fifteen_seconds() {
    let client = HemoClient::new(Arc::new(MissingRealtimeStore));
    let mut events = client.subscribe_events();
    let row = json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "blood_type": "AB+",
        "hospital": "General",
        "units_needed": 2,
        "urgency": "high",
        "created_at": Utc::now().to_rfc3339(),
    });
    client
        .apply_change(&ChangeEvent::inserted(
            Table::Emergencies,
            row.as_object().cloned().expect("object"),
        ))
        .await;
    assert!(matches!(
        events.recv().await.expect("event"),
        ClientEvent::EmergencyRaised(_)
    ));

    let started = tokio::time::Instant::now();
    assert_eq!(
        events.recv().await.expect("event"),
        ClientEvent::EmergencyCleared
    );
    assert!(started.elapsed() >= EMERGENCY_ALERT_TTL);
}

#[tokio::test]
async fn malformed_and_unknown_changes_are_ignored() {
    let client = HemoClient::new(Arc::new(MissingRealtimeStore));
    client
        .apply_change(&ChangeEvent::inserted(
            Table::Donors,
            json!({ "id": "not-a-uuid", "name": "x", "blood_type": "O+" })
                .as_object()
                .cloned()
                .expect("object"),
        ))
        .await;
    client
        .apply_change(&ChangeEvent::deleted(
            Table::Donors,
            json!({ "id": uuid::Uuid::new_v4().to_string() })
                .as_object()
                .cloned()
                .expect("object"),
        ))
        .await;
    assert!(client.donors().await.is_empty());
}

#[tokio::test]
async fn stop_releases_both_subscriptions() {
    let store = storage().await;
    let client = HemoClient::new(store.clone());
    client.start().await.expect("start");
    assert_eq!(store.changes().subscriber_count(), 2);

    client.stop().await;
    assert_eq!(store.changes().subscriber_count(), 0);
    assert!(!client.is_live().await);
    client.stop().await;
}

#[tokio::test]
async fn filtered_donors_and_stats_follow_the_board() {
    let store = storage().await;
    let client = HemoClient::new(store.clone());
    let mut events = client.subscribe_events();
    client.start().await.expect("start");

    for (name, blood_type, location) in [
        ("Ann", BloodType::ONegative, "Brooklyn"),
        ("Ben", BloodType::APositive, "Queens"),
    ] {
        client
            .add_donor(new_donor(name, blood_type, location))
            .await
            .expect("add");
        next_event(&mut events, donors_changed(ChangeKind::Insert)).await;
    }

    let filter = DonorFilter {
        search: "brook".into(),
        blood_type: None,
    };
    let filtered = client.filtered_donors(&filter).await;
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].name, "Ann");

    let stats = client.stats().await;
    assert_eq!(stats.total_donors, 2);
    assert_eq!(stats.available_units, 2);
    assert_eq!(stats.critical_alerts, 6);
    client.stop().await;
}

#[tokio::test]
async fn voice_registration_shows_in_inventory_only_after_its_insert_event() {
    let store = storage().await;
    let client = HemoClient::new(store.clone());
    let mut changes = store
        .subscribe_table(Table::Donors)
        .await
        .expect("subscribe");

    let register = ToolCall {
        id: "call-1".into(),
        name: TOOL_REGISTER_DONOR.into(),
        args: json!({
            "name": "Jane",
            "bloodType": "O-",
            "contact": "555-0100",
            "location": "Brooklyn",
        }),
    };
    let check = ToolCall {
        id: "call-2".into(),
        name: TOOL_CHECK_INVENTORY.into(),
        args: json!({}),
    };

    let registered = tools::execute_tool_call(&*client, &register).await;
    assert!(!registered.is_error());
    let before = tools::execute_tool_call(&*client, &check).await;
    assert_eq!(before.response.result, json!({}));

    let event = changes.try_next().expect("insert event");
    client.apply_change(&event).await;
    let after = tools::execute_tool_call(&*client, &check).await;
    assert_eq!(after.response.result, json!({ "O-": 1 }));
}

#[tokio::test]
async fn search_tool_filters_by_type_and_location() {
    let store = storage().await;
    let client = HemoClient::new(store.clone());
    for (name, blood_type, location) in [
        ("Ann", BloodType::ONegative, "Downtown Brooklyn"),
        ("Ben", BloodType::ONegative, "Queens"),
        ("Cal", BloodType::APositive, "Brooklyn Heights"),
    ] {
        client
            .add_donor(new_donor(name, blood_type, location))
            .await
            .expect("add");
    }

    let rows = client
        .search_donors(Some(BloodType::ONegative), Some("brooklyn".into()))
        .await
        .expect("search");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("Ann"));
}
