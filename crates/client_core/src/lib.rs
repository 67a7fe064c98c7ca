use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::Utc;
use realtime_store::{ChangeEvent, Record, RealtimeStore, RowFilter, Subscription, Table};
use shared::{
    domain::{
        ActivityEvent, BloodType, ChangeKind, Donor, DonorId, DonorPatch, Emergency,
        InventoryItem, NewDonor, NewEmergency,
    },
    error::{ApiException, ErrorCode},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod board;
pub mod config;
pub mod feed;
pub mod hosted_store;
pub mod inventory;
pub mod normalize;
pub mod reconcile;
pub mod tools;
pub mod voice;

pub use board::{DonorBoard, DonorFilter, EMERGENCY_ALERT_TTL};
pub use inventory::DashboardStats;
pub use normalize::DonorChange;
pub use tools::DonorDirectory;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    LoadingChanged(bool),
    SyncingChanged(bool),
    DonorsChanged {
        kind: ChangeKind,
        donor_id: DonorId,
    },
    Activity(ActivityEvent),
    EmergencyRaised(Emergency),
    EmergencyCleared,
    /// User-visible failure of an action, e.g. `Database Error: ...`.
    Alert(String),
    Error(String),
}

/// Live dashboard state bound to a [`RealtimeStore`]. Local donors change only
/// through the store's change feed; actions never edit them directly.
pub struct HemoClient {
    store: Arc<dyn RealtimeStore>,
    board: Arc<RwLock<DonorBoard>>,
    status: Mutex<ClientStatus>,
    feeds: Mutex<Option<LiveFeeds>>,
    events: broadcast::Sender<ClientEvent>,
}

#[derive(Default)]
struct ClientStatus {
    loading: bool,
    in_flight_actions: usize,
}

struct LiveFeeds {
    tasks: Vec<JoinHandle<()>>,
}

impl HemoClient {
    pub fn new(store: Arc<dyn RealtimeStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            store,
            board: Arc::new(RwLock::new(DonorBoard::new())),
            status: Mutex::new(ClientStatus::default()),
            feeds: Mutex::new(None),
            events,
        })
    }

    pub fn store(&self) -> Arc<dyn RealtimeStore> {
        Arc::clone(&self.store)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Subscribes to both tables, loads the current donors and starts
    /// applying change events. Calling it again while running does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<(), ApiException> {
        let mut feeds = self.feeds.lock().await;
        if feeds.is_some() {
            return Ok(());
        }

        let donor_changes = self.store.subscribe_table(Table::Donors).await?;
        let emergency_changes = match self.store.subscribe_table(Table::Emergencies).await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.store.unsubscribe(donor_changes);
                return Err(err);
            }
        };

        self.set_loading(true).await;
        match self.store.query(Table::Donors, &RowFilter::all()).await {
            Ok(rows) => {
                let donors = donors_from_rows(&rows);
                info!(donors = donors.len(), "dashboard: loaded donors");
                self.board.write().await.load(donors);
            }
            Err(err) => {
                warn!("dashboard: failed to load donors: {err}");
                let _ = self.events.send(ClientEvent::Error(format!(
                    "failed to load donors: {}",
                    err.message
                )));
            }
        }
        self.set_loading(false).await;

        *feeds = Some(LiveFeeds {
            tasks: vec![
                self.spawn_feed(donor_changes),
                self.spawn_feed(emergency_changes),
            ],
        });
        Ok(())
    }

    /// Releases both change subscriptions.
    pub async fn stop(&self) {
        let feeds = self.feeds.lock().await.take();
        if let Some(feeds) = feeds {
            for task in feeds.tasks {
                task.abort();
                let _ = task.await;
            }
            debug!("dashboard: change feeds stopped");
        }
    }

    pub async fn is_live(&self) -> bool {
        self.feeds.lock().await.is_some()
    }

    fn spawn_feed(self: &Arc<Self>, mut subscription: Subscription) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                client.apply_change(&event).await;
            }
            debug!(table = %subscription.table(), "dashboard: change feed ended");
        })
    }

    /// Applies one change event to the board.
    pub async fn apply_change(&self, event: &ChangeEvent) {
        match event.table {
            Table::Donors => match DonorChange::from_event(event) {
                Ok(change) => {
                    let captured_at = Utc::now();
                    let activity = {
                        let mut board = self.board.write().await;
                        board.apply(&change, captured_at);
                        board.feed().first().cloned()
                    };
                    let _ = self.events.send(ClientEvent::DonorsChanged {
                        kind: change.kind(),
                        donor_id: change.donor_id(),
                    });
                    if let Some(activity) = activity {
                        let _ = self.events.send(ClientEvent::Activity(activity));
                    }
                }
                Err(err) => {
                    warn!(kind = ?event.kind, "dashboard: dropping donor change: {err}");
                }
            },
            Table::Emergencies => {
                if event.kind != ChangeKind::Insert {
                    debug!(kind = ?event.kind, "dashboard: ignoring emergency change");
                    return;
                }
                match normalize::emergency_from_record(&event.new) {
                    Ok(emergency) => self.raise_emergency(emergency).await,
                    Err(err) => warn!("dashboard: dropping emergency broadcast: {err}"),
                }
            }
        }
    }

    async fn raise_emergency(&self, emergency: Emergency) {
        info!(
            emergency_id = %emergency.id,
            blood_type = %emergency.blood_type,
            hospital = %emergency.hospital,
            "dashboard: emergency broadcast received"
        );
        self.board
            .write()
            .await
            .raise_emergency(emergency.clone(), Instant::now());
        let id = emergency.id;
        let _ = self.events.send(ClientEvent::EmergencyRaised(emergency));

        let board = Arc::clone(&self.board);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EMERGENCY_ALERT_TTL).await;
            if board.write().await.expire_emergency(id) {
                debug!(emergency_id = %id, "dashboard: emergency alert expired");
                let _ = events.send(ClientEvent::EmergencyCleared);
            }
        });
    }

    pub async fn dismiss_emergency(&self) {
        if self.board.write().await.dismiss_emergency() {
            let _ = self.events.send(ClientEvent::EmergencyCleared);
        }
    }

    pub async fn active_emergency(&self) -> Option<Emergency> {
        self.board
            .write()
            .await
            .active_emergency(Instant::now())
            .cloned()
    }

    pub async fn donors(&self) -> Vec<Donor> {
        self.board.read().await.donors().to_vec()
    }

    pub async fn filtered_donors(&self, filter: &DonorFilter) -> Vec<Donor> {
        let board = self.board.read().await;
        filter.apply(board.donors()).into_iter().cloned().collect()
    }

    pub async fn activity(&self) -> Vec<ActivityEvent> {
        self.board.read().await.feed().to_vec()
    }

    pub async fn inventory(&self) -> [InventoryItem; 8] {
        self.board.read().await.inventory()
    }

    pub async fn stats(&self) -> DashboardStats {
        self.board.read().await.stats()
    }

    pub async fn is_loading(&self) -> bool {
        self.status.lock().await.loading
    }

    pub async fn is_syncing(&self) -> bool {
        self.status.lock().await.in_flight_actions > 0
    }

    /// Registers a donor. A missing last donation date means today.
    pub async fn add_donor(&self, mut donor: NewDonor) -> Result<(), ApiException> {
        if donor.last_donation_date.is_none() {
            donor.last_donation_date = Some(Utc::now().date_naive());
        }
        let record = normalize::new_donor_to_record(&donor);
        self.run_action("add donor", async {
            self.store.insert(Table::Donors, record).await.map(|_| ())
        })
        .await
    }

    pub async fn update_donor(&self, id: DonorId, patch: DonorPatch) -> Result<(), ApiException> {
        if patch.is_empty() {
            debug!(donor_id = %id, "dashboard: skipping empty donor update");
            return Ok(());
        }
        let fields = normalize::patch_to_record(&patch);
        self.run_action("update donor", async {
            self.store
                .update(Table::Donors, &id.to_string(), fields)
                .await
        })
        .await
    }

    /// Flips availability based on what the board currently shows.
    pub async fn toggle_availability(&self, id: DonorId) -> Result<(), ApiException> {
        let current = self
            .board
            .read()
            .await
            .donors()
            .iter()
            .find(|donor| donor.id == id)
            .map(|donor| donor.is_available);
        let Some(current) = current else {
            let err = ApiException::new(ErrorCode::NotFound, format!("donor {id} is not listed"));
            self.alert("toggle availability", &err);
            return Err(err);
        };
        self.update_donor(id, DonorPatch::availability(!current))
            .await
    }

    /// Stamps the donor's last-notified time with now.
    pub async fn notify_donor(&self, id: DonorId) -> Result<(), ApiException> {
        self.update_donor(id, DonorPatch::notified_at(Utc::now()))
            .await
    }

    pub async fn delete_donor(&self, id: DonorId) -> Result<(), ApiException> {
        self.run_action("delete donor", async {
            self.store.delete(Table::Donors, &id.to_string()).await
        })
        .await
    }

    /// Inserts an emergency row; the alert shows once its insert event
    /// arrives.
    pub async fn broadcast_emergency(&self, emergency: NewEmergency) -> Result<(), ApiException> {
        if emergency.units_needed < 1 {
            let err = ApiException::validation("units needed must be at least 1");
            self.alert("broadcast emergency", &err);
            return Err(err);
        }
        let record = normalize::new_emergency_to_record(&emergency);
        self.run_action("broadcast emergency", async {
            self.store
                .insert(Table::Emergencies, record)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn run_action<F>(&self, action: &'static str, operation: F) -> Result<(), ApiException>
    where
        F: std::future::Future<Output = Result<(), ApiException>>,
    {
        self.begin_sync().await;
        let result = operation.await;
        self.end_sync().await;
        if let Err(err) = &result {
            self.alert(action, err);
        }
        result
    }

    fn alert(&self, action: &'static str, err: &ApiException) {
        warn!(action, code = ?err.code, "dashboard: action failed: {}", err.message);
        let _ = self
            .events
            .send(ClientEvent::Alert(format!("Database Error: {}", err.message)));
    }

    async fn begin_sync(&self) {
        let mut status = self.status.lock().await;
        status.in_flight_actions += 1;
        if status.in_flight_actions == 1 {
            let _ = self.events.send(ClientEvent::SyncingChanged(true));
        }
    }

    async fn end_sync(&self) {
        let mut status = self.status.lock().await;
        status.in_flight_actions = status.in_flight_actions.saturating_sub(1);
        if status.in_flight_actions == 0 {
            let _ = self.events.send(ClientEvent::SyncingChanged(false));
        }
    }

    async fn set_loading(&self, loading: bool) {
        let mut status = self.status.lock().await;
        if status.loading != loading {
            status.loading = loading;
            let _ = self.events.send(ClientEvent::LoadingChanged(loading));
        }
    }
}

#[async_trait]
impl DonorDirectory for HemoClient {
    async fn search_donors(
        &self,
        blood_type: Option<BloodType>,
        location: Option<String>,
    ) -> Result<Vec<Record>, ApiException> {
        let mut filter = RowFilter::all();
        if let Some(blood_type) = blood_type {
            filter = filter.eq("blood_type", blood_type.as_str());
        }
        if let Some(location) = location {
            filter = filter.contains("location", location);
        }
        self.store.query(Table::Donors, &filter).await
    }

    async fn inventory(&self) -> [InventoryItem; 8] {
        HemoClient::inventory(self).await
    }

    async fn register_donor(&self, donor: NewDonor) -> Result<(), ApiException> {
        let record = normalize::new_donor_to_record(&donor);
        self.store.insert(Table::Donors, record).await.map(|_| ())
    }
}

fn donors_from_rows(rows: &[Record]) -> Vec<Donor> {
    rows.iter()
        .filter_map(|row| match normalize::donor_from_record(row) {
            Ok(donor) => Some(donor),
            Err(err) => {
                warn!("dashboard: skipping malformed donor row: {err}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
