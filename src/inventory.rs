//! First-expiry-first-out stock deduction.
//!
//! Batches are drawn in `(expiry_date, received_date, seq)` order, fresh
//! stock before expired stock. Running out is reported as a shortfall on the
//! result, never as an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::ledger::{LedgerError, LedgerStore, LedgerTx};
use crate::models::{ExpiryWindow, MedicineBatch, NewBatch, Prescription};

#[derive(Debug, Clone, Serialize)]
pub struct BatchDraw {
    pub batch_id: Uuid,
    pub batch_code: String,
    pub taken: i32,
    pub remaining_after: i32,
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeductionResult {
    pub medicine_id: Uuid,
    pub requested: i32,
    pub deducted_total: i32,
    pub shortfall: i32,
    pub draws: Vec<BatchDraw>,
}

/// Takes from `batches` in slice order until `needed` is covered. Returns the
/// amount taken per batch index and what is still missing.
pub fn allocate(batches: &[MedicineBatch], needed: i32) -> (Vec<(usize, i32)>, i32) {
    let mut left = needed.max(0);
    let mut takes = Vec::new();
    for (i, batch) in batches.iter().enumerate() {
        if left == 0 {
            break;
        }
        let take = left.min(batch.remaining.max(0));
        if take > 0 {
            takes.push((i, take));
            left -= take;
        }
    }
    (takes, left)
}

/// Deducts `quantity` units of one medicine inside the caller's transaction.
pub async fn deduct_in(
    tx: &mut dyn LedgerTx,
    medicine_id: Uuid,
    quantity: i32,
    now: DateTime<Utc>,
) -> Result<DeductionResult, LedgerError> {
    if quantity <= 0 {
        return Err(LedgerError::validation("quantity must be greater than 0"));
    }
    if !tx.medicine(medicine_id).await?.is_some_and(|m| m.is_active) {
        return Err(LedgerError::not_found(format!("medicine {medicine_id} not found")));
    }

    let mut result = DeductionResult {
        medicine_id,
        requested: quantity,
        deducted_total: 0,
        shortfall: quantity,
        draws: Vec::new(),
    };

    for window in [ExpiryWindow::Fresh, ExpiryWindow::Expired] {
        if result.shortfall == 0 {
            break;
        }
        let batches = tx.lock_batches(medicine_id, window, now).await?;
        let (takes, left) = allocate(&batches, result.shortfall);
        for (i, take) in takes {
            let batch = &batches[i];
            let remaining_after = batch.remaining - take;
            tx.set_batch_remaining(batch.batch_id, remaining_after).await?;
            result.draws.push(BatchDraw {
                batch_id: batch.batch_id,
                batch_code: batch.batch_code.clone(),
                taken: take,
                remaining_after,
                expired: window == ExpiryWindow::Expired,
            });
            if window == ExpiryWindow::Expired {
                tracing::warn!(
                    %medicine_id,
                    batch_code = %batch.batch_code,
                    taken = take,
                    "dispensing from an expired batch"
                );
            }
        }
        result.deducted_total = quantity - left;
        result.shortfall = left;
    }

    if result.shortfall > 0 {
        tracing::warn!(
            %medicine_id,
            requested = quantity,
            shortfall = result.shortfall,
            "insufficient stock, partial deduction"
        );
    }
    Ok(result)
}

/// Deducts every prescribed medicine, quantities of repeated lines summed.
pub async fn fulfil_prescriptions(
    tx: &mut dyn LedgerTx,
    prescriptions: &[Prescription],
    now: DateTime<Utc>,
) -> Result<Vec<DeductionResult>, LedgerError> {
    let mut per_medicine: BTreeMap<Uuid, i32> = BTreeMap::new();
    for p in prescriptions {
        let slot = per_medicine.entry(p.medicine_id).or_default();
        *slot = slot
            .checked_add(p.quantity)
            .ok_or_else(|| LedgerError::validation("prescribed quantity overflow"))?;
    }

    let mut out = Vec::with_capacity(per_medicine.len());
    for (medicine_id, quantity) in per_medicine {
        out.push(deduct_in(tx, medicine_id, quantity, now).await?);
    }
    Ok(out)
}

#[derive(Clone)]
pub struct InventoryEngine {
    ledger: Arc<dyn LedgerStore>,
}

impl InventoryEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self { ledger }
    }

    pub async fn receive_batch(&self, batch: NewBatch) -> Result<MedicineBatch, LedgerError> {
        if batch.quantity <= 0 {
            return Err(LedgerError::validation("quantity must be greater than 0"));
        }
        if batch.unit_cost < 0 {
            return Err(LedgerError::validation("unit_cost must not be negative"));
        }
        if batch.batch_code.trim().is_empty() {
            return Err(LedgerError::validation("batch_code is required"));
        }
        if batch.expiry_date <= batch.received_date {
            return Err(LedgerError::validation("expiry_date must be after received_date"));
        }

        let mut tx = self.ledger.begin().await?;
        match tx.medicine(batch.medicine_id).await? {
            Some(m) if m.is_active => {}
            Some(_) => return Err(LedgerError::validation("medicine is deactivated")),
            None => return Err(LedgerError::not_found(format!("medicine {} not found", batch.medicine_id))),
        }
        let stored = tx.insert_batch(&batch).await?;
        tx.commit().await?;

        tracing::info!(
            medicine_id = %stored.medicine_id,
            batch_code = %stored.batch_code,
            quantity = stored.quantity,
            "batch received"
        );
        Ok(stored)
    }

    /// Stand-alone deduction in its own transaction.
    pub async fn deduct(&self, medicine_id: Uuid, quantity: i32) -> Result<DeductionResult, LedgerError> {
        let mut tx = self.ledger.begin().await?;
        let result = deduct_in(tx.as_mut(), medicine_id, quantity, Utc::now()).await?;
        tx.commit().await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::models::EntityKind;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    async fn stock(ledger: &MemoryLedger, medicine_id: Uuid, code: &str, qty: i32, expiry: DateTime<Utc>, received: DateTime<Utc>) -> Uuid {
        let mut tx = ledger.begin().await.unwrap();
        let b = tx
            .insert_batch(&NewBatch {
                medicine_id,
                supplier: Some("Pharbaco".into()),
                batch_code: code.into(),
                quantity: qty,
                unit_cost: 1_500,
                expiry_date: expiry,
                received_date: received,
                received_by: None,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        b.batch_id
    }

    async fn deduct_at(ledger: &MemoryLedger, medicine_id: Uuid, qty: i32, now: DateTime<Utc>) -> DeductionResult {
        let mut tx = ledger.begin().await.unwrap();
        let r = deduct_in(tx.as_mut(), medicine_id, qty, now).await.unwrap();
        tx.commit().await.unwrap();
        r
    }

    #[tokio::test]
    async fn earliest_expiry_is_drawn_first() {
        let ledger = MemoryLedger::new();
        let med = ledger.add_medicine("Paracetamol", "tablet", 2_000).await;
        let now = at(2024, 12, 1);
        let b = stock(&ledger, med, "B", 20, at(2025, 6, 1), at(2024, 10, 1)).await;
        let a = stock(&ledger, med, "A", 10, at(2025, 1, 1), at(2024, 11, 1)).await;

        let r = deduct_at(&ledger, med, 15, now).await;

        assert_eq!(r.deducted_total, 15);
        assert_eq!(r.shortfall, 0);
        assert_eq!(ledger.batch(a).await.unwrap().remaining, 0);
        assert_eq!(ledger.batch(b).await.unwrap().remaining, 15);
        assert_eq!(r.draws.iter().map(|d| d.taken).collect::<Vec<_>>(), vec![10, 5]);
    }

    #[tokio::test]
    async fn expired_stock_is_used_only_after_fresh() {
        let ledger = MemoryLedger::new();
        let med = ledger.add_medicine("Amoxicillin", "capsule", 4_000).await;
        let now = at(2025, 3, 1);
        let old = stock(&ledger, med, "OLD", 5, at(2025, 2, 1), at(2024, 1, 1)).await;
        let fresh = stock(&ledger, med, "NEW", 4, at(2026, 2, 1), at(2025, 2, 20)).await;

        let r = deduct_at(&ledger, med, 6, now).await;

        assert_eq!(ledger.batch(fresh).await.unwrap().remaining, 0);
        assert_eq!(ledger.batch(old).await.unwrap().remaining, 3);
        assert_eq!(r.draws.len(), 2);
        assert!(!r.draws[0].expired);
        assert!(r.draws[1].expired);
    }

    #[tokio::test]
    async fn shortfall_is_reported_not_raised() {
        let ledger = MemoryLedger::new();
        let med = ledger.add_medicine("Ibuprofen", "tablet", 3_000).await;
        let now = at(2025, 1, 1);
        let only = stock(&ledger, med, "X", 7, at(2025, 9, 1), at(2024, 12, 1)).await;

        let r = deduct_at(&ledger, med, 10, now).await;

        assert_eq!(r.deducted_total, 7);
        assert_eq!(r.shortfall, 3);
        assert_eq!(ledger.batch(only).await.unwrap().remaining, 0);

        let none = deduct_at(&ledger, med, 2, now).await;
        assert_eq!(none.deducted_total, 0);
        assert_eq!(none.shortfall, 2);
        assert!(none.draws.is_empty());
    }

    #[tokio::test]
    async fn same_expiry_breaks_ties_by_receipt_then_insertion() {
        let ledger = MemoryLedger::new();
        let med = ledger.add_medicine("Cetirizine", "tablet", 1_000).await;
        let now = at(2025, 1, 1);
        let expiry = at(2025, 8, 1);
        let later = stock(&ledger, med, "L", 5, expiry, at(2024, 12, 10)).await;
        let first = stock(&ledger, med, "F1", 5, expiry, at(2024, 12, 1)).await;
        let second = stock(&ledger, med, "F2", 5, expiry, at(2024, 12, 1)).await;

        deduct_at(&ledger, med, 7, now).await;

        assert_eq!(ledger.batch(first).await.unwrap().remaining, 0);
        assert_eq!(ledger.batch(second).await.unwrap().remaining, 3);
        assert_eq!(ledger.batch(later).await.unwrap().remaining, 5);
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let ledger = MemoryLedger::new();
        let med = ledger.add_medicine("Vitamin C", "tablet", 500).await;
        let mut tx = ledger.begin().await.unwrap();
        let err = deduct_in(tx.as_mut(), med, 0, Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        let err = deduct_in(tx.as_mut(), Uuid::new_v4(), 3, Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn deactivated_medicine_is_not_dispensed() {
        let ledger = MemoryLedger::new();
        let med = ledger.add_medicine("Loratadine", "tablet", 1_500).await;
        let now = at(2025, 1, 1);
        let lot = stock(&ledger, med, "L1", 10, at(2025, 10, 1), at(2024, 12, 1)).await;
        let mut tx = ledger.begin().await.unwrap();
        tx.set_active(EntityKind::Medicine, &[med], false).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = ledger.begin().await.unwrap();
        let err = deduct_in(tx.as_mut(), med, 3, now).await.unwrap_err();
        drop(tx);
        assert!(matches!(err, LedgerError::NotFound(_)));
        assert_eq!(ledger.batch(lot).await.unwrap().remaining, 10);
    }

    #[tokio::test]
    async fn failed_batch_write_undoes_earlier_draws() {
        let ledger = MemoryLedger::new();
        let med = ledger.add_medicine("Omeprazole", "capsule", 6_000).await;
        let now = at(2025, 1, 1);
        let a = stock(&ledger, med, "A", 3, at(2025, 4, 1), at(2024, 12, 1)).await;
        let b = stock(&ledger, med, "B", 3, at(2025, 5, 1), at(2024, 12, 1)).await;
        ledger.fail_after_writes(2);

        let mut tx = ledger.begin().await.unwrap();
        let err = deduct_in(tx.as_mut(), med, 5, now).await.unwrap_err();
        drop(tx);

        assert!(matches!(err, LedgerError::Store(_)));
        assert_eq!(ledger.batch(a).await.unwrap().remaining, 3);
        assert_eq!(ledger.batch(b).await.unwrap().remaining, 3);
    }

    #[tokio::test]
    async fn prescriptions_are_aggregated_per_medicine() {
        let ledger = MemoryLedger::new();
        let med = ledger.add_medicine("Paracetamol", "tablet", 2_000).await;
        let now = at(2025, 1, 1);
        let batch = stock(&ledger, med, "P", 20, at(2025, 12, 1), at(2024, 12, 1)).await;

        let mut tx = ledger.begin().await.unwrap();
        let lines = [
            Prescription { medicine_id: med, quantity: 4 },
            Prescription { medicine_id: med, quantity: 6 },
        ];
        let out = fulfil_prescriptions(tx.as_mut(), &lines, now).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].requested, 10);
        assert_eq!(ledger.batch(batch).await.unwrap().remaining, 10);
    }

    #[tokio::test]
    async fn receive_batch_validates_and_stores() {
        let ledger = MemoryLedger::new();
        let med = ledger.add_medicine("Paracetamol", "tablet", 2_000).await;
        let engine = InventoryEngine::new(Arc::new(ledger.clone()));
        let now = Utc::now();
        let mut batch = NewBatch {
            medicine_id: med,
            supplier: None,
            batch_code: "LOT-1".into(),
            quantity: 12,
            unit_cost: 900,
            expiry_date: now + Duration::days(200),
            received_date: now,
            received_by: None,
        };

        let stored = engine.receive_batch(batch.clone()).await.unwrap();
        assert_eq!(stored.remaining, 12);

        batch.expiry_date = now - Duration::days(1);
        assert!(matches!(
            engine.receive_batch(batch).await.unwrap_err(),
            LedgerError::Validation(_)
        ));

        let r = engine.deduct(med, 5).await.unwrap();
        assert_eq!(r.deducted_total, 5);
        assert_eq!(ledger.batch(stored.batch_id).await.unwrap().remaining, 7);
    }

    fn batch_with(remaining: i32) -> MedicineBatch {
        let now = Utc::now();
        MedicineBatch {
            batch_id: Uuid::new_v4(),
            seq: 0,
            medicine_id: Uuid::nil(),
            supplier: None,
            batch_code: String::new(),
            quantity: remaining,
            remaining,
            unit_cost: 0,
            expiry_date: now,
            received_date: now,
            received_by: None,
            is_active: true,
            updated_at: now,
        }
    }

    proptest! {
        #[test]
        fn allocation_never_overdraws(stock in prop::collection::vec(0i32..50, 0..8), needed in 0i32..300) {
            let batches: Vec<_> = stock.iter().map(|r| batch_with(*r)).collect();
            let (takes, left) = allocate(&batches, needed);
            let taken: i32 = takes.iter().map(|(_, t)| t).sum();
            let available: i32 = stock.iter().sum();

            prop_assert_eq!(taken + left, needed);
            prop_assert_eq!(taken, needed.min(available));
            for (i, t) in &takes {
                prop_assert!(*t > 0 && *t <= batches[*i].remaining);
            }
            // a later batch is only touched once every earlier one is empty
            if let Some((last, _)) = takes.last() {
                for (i, b) in batches.iter().enumerate().take(*last) {
                    let drawn = takes.iter().find(|(j, _)| *j == i).map(|(_, t)| *t).unwrap_or(0);
                    prop_assert_eq!(drawn, b.remaining);
                }
            }
        }
    }
}
