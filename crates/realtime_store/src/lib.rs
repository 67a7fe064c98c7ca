use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::{domain::ChangeKind, error::ApiException};
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::debug;

/// A raw row as the remote store sends it: snake_case column names.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Donors,
    Emergencies,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Donors => "donors",
            Table::Emergencies => "emergencies",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "donors" => Some(Table::Donors),
            "emergencies" => Some(Table::Emergencies),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row insertion, update or deletion. `new` carries the full or partial
/// row for inserts and updates; `old` carries at least the id for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    #[serde(default)]
    pub new: Record,
    #[serde(default)]
    pub old: Record,
}

impl ChangeEvent {
    pub fn inserted(table: Table, new: Record) -> Self {
        Self {
            table,
            kind: ChangeKind::Insert,
            new,
            old: Record::new(),
        }
    }

    pub fn updated(table: Table, new: Record, old: Record) -> Self {
        Self {
            table,
            kind: ChangeKind::Update,
            new,
            old,
        }
    }

    pub fn deleted(table: Table, old: Record) -> Self {
        Self {
            table,
            kind: ChangeKind::Delete,
            new: Record::new(),
            old,
        }
    }

    pub fn row_id(&self) -> Option<&str> {
        let primary = match self.kind {
            ChangeKind::Delete => &self.old,
            ChangeKind::Insert | ChangeKind::Update => &self.new,
        };
        primary
            .get("id")
            .or_else(|| self.old.get("id"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    /// Exact column matches.
    pub equals: Vec<(String, Value)>,
    /// Case-insensitive substring matches.
    pub contains_ci: Vec<(String, String)>,
    pub order: SortOrder,
}

impl RowFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((column.into(), value.into()));
        self
    }

    pub fn contains(mut self, column: impl Into<String>, needle: impl Into<String>) -> Self {
        self.contains_ci.push((column.into(), needle.into()));
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        let equals = self
            .equals
            .iter()
            .all(|(column, expected)| record.get(column) == Some(expected));
        let contains = self.contains_ci.iter().all(|(column, needle)| {
            record
                .get(column)
                .and_then(Value::as_str)
                .is_some_and(|value| value.to_lowercase().contains(&needle.to_lowercase()))
        });
        equals && contains
    }
}

#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn query(&self, table: Table, filter: &RowFilter) -> Result<Vec<Record>, ApiException>;
    /// Returns the stored row, including generated columns.
    async fn insert(&self, table: Table, record: Record) -> Result<Record, ApiException>;
    async fn update(&self, table: Table, id: &str, fields: Record) -> Result<(), ApiException>;
    async fn delete(&self, table: Table, id: &str) -> Result<(), ApiException>;
    async fn subscribe_table(&self, table: Table) -> Result<Subscription, ApiException>;

    fn unsubscribe(&self, subscription: Subscription) {
        subscription.release();
    }
}

pub struct MissingRealtimeStore;

#[async_trait]
impl RealtimeStore for MissingRealtimeStore {
    async fn query(&self, table: Table, _filter: &RowFilter) -> Result<Vec<Record>, ApiException> {
        Err(ApiException::unavailable(format!(
            "remote store unavailable for table {table}"
        )))
    }

    async fn insert(&self, table: Table, _record: Record) -> Result<Record, ApiException> {
        Err(ApiException::unavailable(format!(
            "remote store unavailable for table {table}"
        )))
    }

    async fn update(&self, table: Table, _id: &str, _fields: Record) -> Result<(), ApiException> {
        Err(ApiException::unavailable(format!(
            "remote store unavailable for table {table}"
        )))
    }

    async fn delete(&self, table: Table, _id: &str) -> Result<(), ApiException> {
        Err(ApiException::unavailable(format!(
            "remote store unavailable for table {table}"
        )))
    }

    async fn subscribe_table(&self, table: Table) -> Result<Subscription, ApiException> {
        Err(ApiException::unavailable(format!(
            "change feed unavailable for table {table}"
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Disposable handle on a table's change stream. Dropping it unsubscribes
/// and aborts any feed task attached to it.
pub struct Subscription {
    id: SubscriptionId,
    table: Table,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    registry: Weak<Mutex<Registry>>,
    tasks: Vec<AbortHandle>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Next event in delivery order; `None` once the feed is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }

    /// Ties a background feed task to this handle's lifetime.
    pub fn attach_task(&mut self, task: AbortHandle) {
        self.tasks.push(task);
    }

    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).subscribers.remove(&self.id);
        }
        debug!(subscription = %self.id, table = %self.table, "change subscription released");
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<SubscriptionId, Subscriber>,
}

struct Subscriber {
    table: Table,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

/// Fans change events out to every live subscription on the event's table.
#[derive(Clone, Default)]
pub struct ChangeBroker {
    registry: Arc<Mutex<Registry>>,
}

impl ChangeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, table: Table) -> Subscription {
        let (sender, events) = mpsc::unbounded_channel();
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .subscribers
            .insert(id, Subscriber { table, sender });
        debug!(subscription = %id, %table, "change subscription opened");
        Subscription {
            id,
            table,
            events,
            registry: Arc::downgrade(&self.registry),
            tasks: Vec::new(),
        }
    }

    /// Returns how many subscriptions received the event.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut delivered = 0;
        lock(&self.registry).subscribers.retain(|id, subscriber| {
            if subscriber.table != event.table {
                return true;
            }
            match subscriber.sender.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    debug!(subscription = %id, "pruning closed change subscription");
                    false
                }
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
