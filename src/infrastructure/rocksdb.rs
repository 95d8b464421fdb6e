use crate::domain::audit::AuditRecord;
use crate::domain::pending_payment::PendingPayment;
use crate::domain::ports::{
    AuditTrail, Claim, PendingPaymentStore, StateChange, TransitionOutcome, WebhookLedger,
    lease_lapsed,
};
use crate::domain::settlement::SettledPayment;
use crate::domain::webhook::IngestResult;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Pending payments keyed by id.
pub const CF_PENDING: &str = "pending";
/// Reference to pending payment id.
pub const CF_REFERENCES: &str = "references";
/// Settled payments keyed by payment id.
pub const CF_PAYMENTS: &str = "payments";
/// Bank transaction id to the payment it settled.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Webhook ledger keyed by bank transaction id.
pub const CF_WEBHOOKS: &str = "webhooks";
/// Audit records keyed by their big-endian append sequence.
pub const CF_AUDIT: &str = "audit";
/// Counters.
pub const CF_META: &str = "meta";

const REFERENCE_SEQUENCE_KEY: &[u8] = b"reference_sequence";
const AUDIT_SEQUENCE_KEY: &[u8] = b"audit_sequence";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
enum LedgerEntry {
    InFlight { claimed_at: DateTime<Utc> },
    Completed(IngestResult),
}

/// A persistent store implementation using RocksDB.
///
/// Holds pending payments, settlements, the webhook ledger and the audit trail
/// in separate column families. Every read-modify-write runs under a single
/// writer lock and commits through one `WriteBatch`, so a state transition and
/// the settlement it creates land together or not at all.
///
/// `Clone` shares the underlying `Arc<DB>` and writer lock.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    writer: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path` with all column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [
            CF_PENDING,
            CF_REFERENCES,
            CF_PAYMENTS,
            CF_TRANSACTIONS,
            CF_WEBHOOKS,
            CF_AUDIT,
            CF_META,
        ]
        .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            PaymentError::InternalError(Box::new(std::io::Error::other(format!(
                "Column family {} not found",
                name
            ))))
        })
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn counter(&self, key: &[u8]) -> Result<u64> {
        match self.db.get_cf(self.cf(CF_META)?, key)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    PaymentError::InternalError(Box::new(std::io::Error::other(
                        "Corrupt counter value",
                    )))
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn scan<T: for<'de> Deserialize<'de>>(&self, cf: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_key, value) = item?;
            items.push(serde_json::from_slice(&value)?);
        }
        Ok(items)
    }
}

#[async_trait]
impl PendingPaymentStore for RocksDBStore {
    async fn next_sequence(&self) -> Result<u64> {
        let _guard = self.writer.lock().await;
        let next = self.counter(REFERENCE_SEQUENCE_KEY)? + 1;
        self.db
            .put_cf(self.cf(CF_META)?, REFERENCE_SEQUENCE_KEY, next.to_be_bytes())?;
        Ok(next)
    }

    async fn insert(&self, payment: PendingPayment) -> Result<()> {
        let _guard = self.writer.lock().await;
        let references = self.cf(CF_REFERENCES)?;
        if self
            .db
            .get_pinned_cf(references, payment.reference.as_bytes())?
            .is_some()
        {
            return Err(PaymentError::Conflict(format!(
                "Reference {} already issued",
                payment.reference
            )));
        }
        let pending = self.cf(CF_PENDING)?;
        if self.db.get_pinned_cf(pending, payment.id.as_bytes())?.is_some() {
            return Err(PaymentError::Conflict(format!(
                "Pending payment {} already exists",
                payment.id
            )));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(references, payment.reference.as_bytes(), payment.id.as_bytes());
        batch.put_cf(pending, payment.id.as_bytes(), serde_json::to_vec(&payment)?);
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PendingPayment>> {
        self.read(CF_PENDING, id.as_bytes())
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PendingPayment>> {
        let Some(raw_id) = self
            .db
            .get_cf(self.cf(CF_REFERENCES)?, reference.as_bytes())?
        else {
            return Ok(None);
        };
        self.read(CF_PENDING, &raw_id)
    }

    async fn transition(&self, id: Uuid, change: StateChange) -> Result<TransitionOutcome> {
        let _guard = self.writer.lock().await;
        let current: PendingPayment = self
            .read(CF_PENDING, id.as_bytes())?
            .ok_or_else(|| PaymentError::NotFound(format!("Pending payment {}", id)))?;

        if current.state != change.expected {
            return Ok(TransitionOutcome::Conflict(current));
        }
        let settled_tx = change
            .settlement
            .as_ref()
            .and_then(|p| p.external_transaction_id.as_deref());
        if let Some(tx) = settled_tx {
            if self
                .db
                .get_pinned_cf(self.cf(CF_TRANSACTIONS)?, tx.as_bytes())?
                .is_some()
            {
                return Err(PaymentError::TransactionAlreadyApplied(tx.to_string()));
            }
        }

        let mut updated = current;
        updated.apply(
            change.transition,
            change.settlement.as_ref().map(|p| p.id),
            &change.note,
            change.at,
        )?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_PENDING)?,
            updated.id.as_bytes(),
            serde_json::to_vec(&updated)?,
        );
        if let Some(payment) = &change.settlement {
            batch.put_cf(
                self.cf(CF_PAYMENTS)?,
                payment.id.as_bytes(),
                serde_json::to_vec(payment)?,
            );
            if let Some(tx) = &payment.external_transaction_id {
                batch.put_cf(self.cf(CF_TRANSACTIONS)?, tx.as_bytes(), payment.id.as_bytes());
            }
        }
        self.db.write(batch)?;
        Ok(TransitionOutcome::Applied(updated))
    }

    async fn append_observation(
        &self,
        id: Uuid,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<PendingPayment> {
        let _guard = self.writer.lock().await;
        let mut current: PendingPayment = self
            .read(CF_PENDING, id.as_bytes())?
            .ok_or_else(|| PaymentError::NotFound(format!("Pending payment {}", id)))?;
        current.append_observation(note, at);
        self.db.put_cf(
            self.cf(CF_PENDING)?,
            current.id.as_bytes(),
            serde_json::to_vec(&current)?,
        )?;
        Ok(current)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<PendingPayment>> {
        let mut overdue: Vec<PendingPayment> = self
            .scan::<PendingPayment>(CF_PENDING)?
            .into_iter()
            .filter(|p| p.is_overdue(now))
            .collect();
        overdue.sort_by_key(|p| p.expiration_timestamp);
        Ok(overdue)
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<SettledPayment>> {
        self.read(CF_PAYMENTS, payment_id.as_bytes())
    }

    async fn payment_for_transaction(&self, transaction_id: &str) -> Result<Option<SettledPayment>> {
        let Some(raw_id) = self
            .db
            .get_cf(self.cf(CF_TRANSACTIONS)?, transaction_id.as_bytes())?
        else {
            return Ok(None);
        };
        self.read(CF_PAYMENTS, &raw_id)
    }

    async fn attach_receipt(&self, payment_id: Uuid, receipt_url: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        let mut payment: SettledPayment = self
            .read(CF_PAYMENTS, payment_id.as_bytes())?
            .ok_or_else(|| PaymentError::NotFound(format!("Payment {}", payment_id)))?;
        payment.receipt_url = Some(receipt_url.to_string());
        self.db.put_cf(
            self.cf(CF_PAYMENTS)?,
            payment_id.as_bytes(),
            serde_json::to_vec(&payment)?,
        )?;
        Ok(())
    }
}

#[async_trait]
impl WebhookLedger for RocksDBStore {
    async fn claim(
        &self,
        transaction_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Claim> {
        let _guard = self.writer.lock().await;
        match self.read::<LedgerEntry>(CF_WEBHOOKS, transaction_id.as_bytes())? {
            Some(LedgerEntry::Completed(result)) => Ok(Claim::Completed(result)),
            Some(LedgerEntry::InFlight { claimed_at }) if !lease_lapsed(claimed_at, now, lease) => {
                Ok(Claim::InFlight)
            }
            _ => {
                self.db.put_cf(
                    self.cf(CF_WEBHOOKS)?,
                    transaction_id.as_bytes(),
                    serde_json::to_vec(&LedgerEntry::InFlight { claimed_at: now })?,
                )?;
                Ok(Claim::Claimed)
            }
        }
    }

    async fn complete(&self, transaction_id: &str, result: IngestResult) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.db.put_cf(
            self.cf(CF_WEBHOOKS)?,
            transaction_id.as_bytes(),
            serde_json::to_vec(&LedgerEntry::Completed(result))?,
        )?;
        Ok(())
    }

    async fn release(&self, transaction_id: &str) -> Result<()> {
        let _guard = self.writer.lock().await;
        if let Some(LedgerEntry::InFlight { .. }) =
            self.read::<LedgerEntry>(CF_WEBHOOKS, transaction_id.as_bytes())?
        {
            self.db
                .delete_cf(self.cf(CF_WEBHOOKS)?, transaction_id.as_bytes())?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditTrail for RocksDBStore {
    async fn append(&self, record: AuditRecord) -> Result<()> {
        let _guard = self.writer.lock().await;
        let next = self.counter(AUDIT_SEQUENCE_KEY)? + 1;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_AUDIT)?, next.to_be_bytes(), serde_json::to_vec(&record)?);
        batch.put_cf(self.cf(CF_META)?, AUDIT_SEQUENCE_KEY, next.to_be_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    async fn records_for(&self, subject: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .scan::<AuditRecord>(CF_AUDIT)?
            .into_iter()
            .filter(|r| r.subject == subject)
            .collect())
    }

    async fn all(&self) -> Result<Vec<AuditRecord>> {
        self.scan(CF_AUDIT)
    }
}
