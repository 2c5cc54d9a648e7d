//! Persistence seam
//!
//! The store is the source of truth for instance records, the signal log, open
//! positions and the archive of closed ones. The in-memory engine state is a
//! cache rebuilt from it on start.
//!
//! [`InMemoryPersistence`] keeps records and positions as JSON documents, the
//! way a document store would, and can be switched unavailable to exercise the
//! transient-failure paths.

use crate::error::PersistenceError;
use crate::position::CapitalLedger;
use async_trait::async_trait;
use config::InstanceConfig;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use types::{
    ExitDetails, InstanceId, Position, PositionId, Signal, SignalCategory, TimestampMs,
};

/// Durable state of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub config: InstanceConfig,
    /// Restarted by the supervisor at boot when set
    pub running: bool,
    pub ledger: CapitalLedger,
    pub last_entry_time: Option<TimestampMs>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

/// Filter for [`Persistence::query_signals`]
#[derive(Debug, Clone, PartialEq)]
pub struct SignalQuery {
    pub instance_id: InstanceId,
    pub category: Option<SignalCategory>,
    pub since: Option<TimestampMs>,
}

impl SignalQuery {
    pub fn for_instance(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            category: None,
            since: None,
        }
    }

    pub fn category(mut self, category: SignalCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn since(mut self, since: TimestampMs) -> Self {
        self.since = Some(since);
        self
    }

    fn matches(&self, signal: &Signal) -> bool {
        signal.instance_id == self.instance_id
            && self.category.map_or(true, |c| signal.kind.category() == c)
            && self.since.map_or(true, |t| signal.timestamp >= t)
    }
}

/// Closed position with its exit details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedPosition {
    pub instance_id: InstanceId,
    pub position: Position,
    pub details: ExitDetails,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_instances(&self) -> Result<Vec<InstanceRecord>, PersistenceError>;

    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), PersistenceError>;

    async fn delete_instance(&self, instance_id: InstanceId) -> Result<(), PersistenceError>;

    /// Append to the signal log; appending the same signal id twice is a no-op
    async fn append_signal(&self, signal: &Signal) -> Result<(), PersistenceError>;

    /// Matching signals in timestamp order
    async fn query_signals(&self, query: &SignalQuery) -> Result<Vec<Signal>, PersistenceError>;

    async fn save_open_position(
        &self,
        instance_id: InstanceId,
        position: &Position,
    ) -> Result<(), PersistenceError>;

    /// Move an open position to the archive
    async fn close_position(
        &self,
        position_id: PositionId,
        details: &ExitDetails,
    ) -> Result<(), PersistenceError>;

    async fn load_open_position(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<Position>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    instances: DashMap<InstanceId, String>,
    open_positions: DashMap<InstanceId, String>,
    signals: RwLock<Vec<Signal>>,
    archive: RwLock<Vec<ArchivedPosition>>,
    unavailable: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated store outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn archived(&self) -> Vec<ArchivedPosition> {
        self.archive.read().clone()
    }

    pub fn signal_count(&self) -> usize {
        self.signals.read().len()
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable {
                message: "store offline".to_string(),
            });
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|e| PersistenceError::Serialization {
        message: e.to_string(),
    })
}

fn decode<T: for<'de> Deserialize<'de>>(document: &str) -> Result<T, PersistenceError> {
    serde_json::from_str(document).map_err(|e| PersistenceError::Serialization {
        message: e.to_string(),
    })
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn load_instances(&self) -> Result<Vec<InstanceRecord>, PersistenceError> {
        self.check_available()?;
        let mut records = self
            .instances
            .iter()
            .map(|doc| decode::<InstanceRecord>(doc.value()))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| (r.created_at, r.instance_id.inner()));
        Ok(records)
    }

    async fn save_instance(&self, record: &InstanceRecord) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.instances.insert(record.instance_id, encode(record)?);
        Ok(())
    }

    async fn delete_instance(&self, instance_id: InstanceId) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.instances
            .remove(&instance_id)
            .map(|_| ())
            .ok_or_else(|| PersistenceError::NotFound {
                what: format!("instance {instance_id}"),
            })
    }

    async fn append_signal(&self, signal: &Signal) -> Result<(), PersistenceError> {
        self.check_available()?;
        let mut signals = self.signals.write();
        if !signals.iter().any(|s| s.id == signal.id) {
            signals.push(signal.clone());
        }
        Ok(())
    }

    async fn query_signals(&self, query: &SignalQuery) -> Result<Vec<Signal>, PersistenceError> {
        self.check_available()?;
        let mut found: Vec<Signal> = self
            .signals
            .read()
            .iter()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.timestamp);
        Ok(found)
    }

    async fn save_open_position(
        &self,
        instance_id: InstanceId,
        position: &Position,
    ) -> Result<(), PersistenceError> {
        self.check_available()?;
        self.open_positions.insert(instance_id, encode(position)?);
        Ok(())
    }

    async fn close_position(
        &self,
        position_id: PositionId,
        details: &ExitDetails,
    ) -> Result<(), PersistenceError> {
        self.check_available()?;
        if self
            .archive
            .read()
            .iter()
            .any(|a| a.position.position_id == position_id)
        {
            return Ok(());
        }

        let mut owner = None;
        for doc in self.open_positions.iter() {
            let position: Position = decode(doc.value())?;
            if position.position_id == position_id {
                owner = Some((*doc.key(), position));
                break;
            }
        }
        let Some((instance_id, mut position)) = owner else {
            return Err(PersistenceError::NotFound {
                what: format!("open position {position_id}"),
            });
        };

        self.open_positions.remove(&instance_id);
        position.status = types::PositionStatus::Closed;
        self.archive.write().push(ArchivedPosition {
            instance_id,
            position,
            details: details.clone(),
        });
        Ok(())
    }

    async fn load_open_position(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<Position>, PersistenceError> {
        self.check_available()?;
        self.open_positions
            .get(&instance_id)
            .map(|doc| decode(doc.value()))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use types::{
        Entry, EntryType, ExitReason, PositionStatus, SignalId, SignalKind, SignalMetadata,
    };

    fn position(id: u64) -> Position {
        Position::open(
            PositionId::new(id),
            "BTCUSDT",
            Entry {
                time: 1_000,
                price: 100.0,
                entry_type: EntryType::First,
                allocation_fraction: dec!(0.10),
                quote_amount: dec!(100),
                base_amount: dec!(1),
            },
        )
    }

    fn signal(id: u64, kind: SignalKind, ts: u64) -> Signal {
        Signal {
            id: SignalId::new(id),
            instance_id: InstanceId::new(1),
            symbol: "BTCUSDT".to_string(),
            kind,
            price: 100.0,
            timestamp: ts,
            allocation_fraction: None,
            quote_amount: None,
            profit: None,
            profit_percent: None,
            metadata: SignalMetadata::default(),
            position_id: PositionId::new(9),
        }
    }

    fn details() -> ExitDetails {
        ExitDetails {
            exit_time: 2_000,
            exit_price: 110.0,
            exit_quote: dec!(110),
            exit_base: dec!(1),
            reason: ExitReason::UpperBandReturn,
            profit: dec!(10),
            profit_percent: dec!(10),
            order_id: None,
        }
    }

    #[tokio::test]
    async fn test_instance_records_round_trip() {
        let store = InMemoryPersistence::new();
        let record = InstanceRecord {
            instance_id: InstanceId::new(7),
            config: InstanceConfig::new("BTCUSDT", dec!(1000)),
            running: true,
            ledger: CapitalLedger::new(dec!(1000)),
            last_entry_time: Some(5),
            created_at: 1,
            updated_at: 2,
        };
        store.save_instance(&record).await.unwrap();
        assert_eq!(store.load_instances().await.unwrap(), vec![record.clone()]);

        store.delete_instance(record.instance_id).await.unwrap();
        assert!(store.load_instances().await.unwrap().is_empty());
        assert!(matches!(
            store.delete_instance(record.instance_id).await,
            Err(PersistenceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_signal_log_filters_and_dedupes() {
        let store = InMemoryPersistence::new();
        let entry = signal(1, SignalKind::Entry(EntryType::First), 10);
        let exit = signal(2, SignalKind::Exit(ExitReason::Manual), 20);
        store.append_signal(&entry).await.unwrap();
        store.append_signal(&entry).await.unwrap();
        store.append_signal(&exit).await.unwrap();
        assert_eq!(store.signal_count(), 2);

        let query = SignalQuery::for_instance(InstanceId::new(1));
        assert_eq!(store.query_signals(&query).await.unwrap().len(), 2);
        let exits = store
            .query_signals(&query.clone().category(SignalCategory::Exit))
            .await
            .unwrap();
        assert_eq!(exits, vec![exit]);
        assert!(store
            .query_signals(&query.since(21))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_close_position_archives_once() {
        let store = InMemoryPersistence::new();
        let instance = InstanceId::new(1);
        store.save_open_position(instance, &position(3)).await.unwrap();
        assert!(store.load_open_position(instance).await.unwrap().is_some());

        store.close_position(PositionId::new(3), &details()).await.unwrap();
        store.close_position(PositionId::new(3), &details()).await.unwrap();
        assert!(store.load_open_position(instance).await.unwrap().is_none());
        let archived = store.archived();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].position.status, PositionStatus::Closed);

        assert!(matches!(
            store.close_position(PositionId::new(4), &details()).await,
            Err(PersistenceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryPersistence::new();
        store.set_unavailable(true);
        let err = store.load_instances().await.unwrap_err();
        assert!(err.is_retryable());
        store.set_unavailable(false);
        assert!(store.load_instances().await.is_ok());
    }
}
