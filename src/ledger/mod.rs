//! Ledger Store seam: transactional persistence for batches, invoices,
//! payments and the soft-delete flags of every cascading entity.
//!
//! Every engine operation opens one [`LedgerTx`], performs its reads and
//! writes through it and commits. Dropping a transaction without committing
//! rolls it back.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::Edge;
use crate::models::{
    EntityHead, EntityKind, ExpiryWindow, Invoice, InvoiceStatus, MedicalRecord, MedicineBatch,
    MedicineRow, NewBatch, NewInvoice, NewPayment, Payment, SessionActor,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryLedger;
pub use pg::PgLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("payment amount {amount} exceeds remaining balance {remaining}")]
    Overpayment { amount: i64, remaining: i64 },
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Guard(String),
    #[error("store error: {0}")]
    Store(String),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        LedgerError::NotFound(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = e {
            // 40001 serialization_failure, 40P01 deadlock_detected
            let code = db_err.code();
            if db_err.is_unique_violation() || matches!(code.as_deref(), Some("40001" | "40P01")) {
                return LedgerError::Conflict(db_err.message().to_string());
            }
        }
        LedgerError::Store(format!("db error: {e}"))
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError>;

    /// Resolves a hashed bearer token to the acting user, outside any ledger
    /// transaction.
    async fn session_actor(&self, token_hash: &str) -> Result<Option<SessionActor>, LedgerError>;
}

#[async_trait]
pub trait LedgerTx: Send {
    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;

    // inventory
    async fn medicine(&mut self, medicine_id: Uuid) -> Result<Option<MedicineRow>, LedgerError>;

    /// Active batches of one medicine with `remaining > 0` on the requested
    /// side of `now`, ordered by `(expiry_date, received_date, seq)` and held
    /// for update until the transaction ends.
    async fn lock_batches(
        &mut self,
        medicine_id: Uuid,
        window: ExpiryWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<MedicineBatch>, LedgerError>;

    async fn set_batch_remaining(&mut self, batch_id: Uuid, remaining: i32) -> Result<(), LedgerError>;
    async fn insert_batch(&mut self, batch: &NewBatch) -> Result<MedicineBatch, LedgerError>;

    // invoices
    async fn medical_record(&mut self, record_id: Uuid) -> Result<Option<MedicalRecord>, LedgerError>;
    async fn active_invoice_for_appointment(
        &mut self,
        appointment_id: Uuid,
    ) -> Result<Option<Invoice>, LedgerError>;
    async fn insert_invoice(&mut self, invoice: &NewInvoice) -> Result<Invoice, LedgerError>;
    async fn lock_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, LedgerError>;
    async fn set_invoice_status(&mut self, invoice_id: Uuid, status: InvoiceStatus) -> Result<(), LedgerError>;

    // payments
    async fn payment(&mut self, payment_id: Uuid) -> Result<Option<Payment>, LedgerError>;
    async fn active_payments(&mut self, invoice_id: Uuid) -> Result<Vec<Payment>, LedgerError>;
    async fn insert_payment(&mut self, payment: &NewPayment) -> Result<Payment, LedgerError>;
    async fn set_payment_amount(&mut self, payment_id: Uuid, amount: i64) -> Result<(), LedgerError>;
    async fn set_payment_active(&mut self, payment_id: Uuid, active: bool) -> Result<(), LedgerError>;

    /// Active login account linked to a patient, if the patient has one.
    async fn patient_login(&mut self, patient_id: Uuid) -> Result<Option<Uuid>, LedgerError>;

    // lifecycle
    async fn entity_head(&mut self, kind: EntityKind, id: Uuid) -> Result<Option<EntityHead>, LedgerError>;
    async fn dependents(&mut self, edge: &Edge, parent_id: Uuid) -> Result<Vec<EntityHead>, LedgerError>;
    async fn set_active(&mut self, kind: EntityKind, ids: &[Uuid], active: bool) -> Result<u64, LedgerError>;
    async fn hard_delete(&mut self, kind: EntityKind, ids: &[Uuid]) -> Result<u64, LedgerError>;
}

/// Re-runs a whole operation while the store reports a write conflict.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let attempts = attempts.max(1);
    let mut tried = 0;
    loop {
        tried += 1;
        match op().await {
            Err(e) if e.is_conflict() && tried < attempts => {
                tracing::warn!(attempt = tried, error = %e, "write conflict, retrying operation");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_only_conflicts() {
        let calls = AtomicU32::new(0);
        let out = retry_on_conflict(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LedgerError::Conflict("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 2);

        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_on_conflict(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LedgerError::validation("bad")) }
        })
        .await;
        assert!(matches!(out, Err(LedgerError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = retry_on_conflict(2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LedgerError::Conflict("busy".into())) }
        })
        .await;
        assert!(out.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
