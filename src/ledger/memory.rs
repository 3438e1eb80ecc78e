//! In-memory ledger. A transaction holds the store's async mutex for its whole
//! lifetime and works on a copy of the state, so transactions are fully
//! serialized and a dropped transaction leaves nothing behind.
//!
//! A task must not open a second transaction while it still holds one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{LedgerError, LedgerStore, LedgerTx};
use crate::lifecycle::Edge;
use crate::models::{
    EntityHead, EntityKind, ExpiryWindow, Invoice, InvoiceStatus, MedicalRecord, MedicineBatch,
    MedicineRow, NewBatch, NewInvoice, NewPayment, Payment, Prescription, Role, SessionActor,
};

#[derive(Debug, Clone, Default)]
struct EntityRow {
    is_active: bool,
    status: Option<i16>,
    links: BTreeMap<&'static str, Uuid>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record: MedicalRecord,
    doctor_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
struct LedgerState {
    medicines: BTreeMap<Uuid, MedicineRow>,
    batches: BTreeMap<Uuid, MedicineBatch>,
    next_seq: i64,
    records: BTreeMap<Uuid, StoredRecord>,
    invoices: BTreeMap<Uuid, Invoice>,
    payments: BTreeMap<Uuid, Payment>,
    entities: BTreeMap<(EntityKind, Uuid), EntityRow>,
    sessions: HashMap<String, SessionActor>,
}

impl LedgerState {
    fn ids_of(&self, kind: EntityKind) -> Vec<Uuid> {
        match kind {
            EntityKind::Medicine => self.medicines.keys().copied().collect(),
            EntityKind::MedicineBatch => self.batches.keys().copied().collect(),
            EntityKind::MedicalRecord => self.records.keys().copied().collect(),
            EntityKind::Invoice => self.invoices.keys().copied().collect(),
            EntityKind::Payment => self.payments.keys().copied().collect(),
            _ => self
                .entities
                .keys()
                .filter(|(k, _)| *k == kind)
                .map(|(_, id)| *id)
                .collect(),
        }
    }

    fn head(&self, kind: EntityKind, id: Uuid) -> Option<EntityHead> {
        let (is_active, status) = match kind {
            EntityKind::Medicine => (self.medicines.get(&id)?.is_active, None),
            EntityKind::MedicineBatch => (self.batches.get(&id)?.is_active, None),
            EntityKind::MedicalRecord => (self.records.get(&id)?.record.is_active, None),
            EntityKind::Invoice => (self.invoices.get(&id)?.is_active, None),
            EntityKind::Payment => (self.payments.get(&id)?.is_active, None),
            _ => {
                let row = self.entities.get(&(kind, id))?;
                (row.is_active, row.status)
            }
        };
        Some(EntityHead { id, is_active, status })
    }

    fn link(&self, kind: EntityKind, id: Uuid, link: &str) -> Option<Uuid> {
        match (kind, link) {
            (EntityKind::MedicineBatch, "medicine_id") => self.batches.get(&id).map(|b| b.medicine_id),
            (EntityKind::MedicalRecord, "patient_id") => self.records.get(&id).map(|r| r.record.patient_id),
            (EntityKind::MedicalRecord, "appointment_id") => {
                self.records.get(&id).and_then(|r| r.record.appointment_id)
            }
            (EntityKind::MedicalRecord, "doctor_id") => self.records.get(&id).and_then(|r| r.doctor_id),
            (EntityKind::Invoice, "patient_id") => self.invoices.get(&id).map(|i| i.patient_id),
            (EntityKind::Invoice, "appointment_id") => self.invoices.get(&id).map(|i| i.appointment_id),
            (EntityKind::Payment, "invoice_id") => self.payments.get(&id).map(|p| p.invoice_id),
            (EntityKind::Medicine, _)
            | (EntityKind::MedicineBatch, _)
            | (EntityKind::MedicalRecord, _)
            | (EntityKind::Invoice, _)
            | (EntityKind::Payment, _) => None,
            _ => self
                .entities
                .get(&(kind, id))
                .and_then(|row| row.links.get(link).copied()),
        }
    }

    fn flip(&mut self, kind: EntityKind, id: Uuid, active: bool) -> bool {
        let flag = match kind {
            EntityKind::Medicine => self.medicines.get_mut(&id).map(|m| &mut m.is_active),
            EntityKind::MedicineBatch => self.batches.get_mut(&id).map(|b| &mut b.is_active),
            EntityKind::MedicalRecord => self.records.get_mut(&id).map(|r| &mut r.record.is_active),
            EntityKind::Invoice => self.invoices.get_mut(&id).map(|i| &mut i.is_active),
            EntityKind::Payment => self.payments.get_mut(&id).map(|p| &mut p.is_active),
            _ => self.entities.get_mut(&(kind, id)).map(|r| &mut r.is_active),
        };
        match flag {
            Some(flag) if *flag != active => {
                *flag = active;
                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, kind: EntityKind, id: Uuid) -> bool {
        match kind {
            EntityKind::Medicine => self.medicines.remove(&id).is_some(),
            EntityKind::MedicineBatch => self.batches.remove(&id).is_some(),
            EntityKind::MedicalRecord => self.records.remove(&id).is_some(),
            EntityKind::Invoice => self.invoices.remove(&id).is_some(),
            EntityKind::Payment => self.payments.remove(&id).is_some(),
            _ => self.entities.remove(&(kind, id)).is_some(),
        }
    }

    fn active_invoice_for(&self, appointment_id: Uuid, except: Option<Uuid>) -> Option<&Invoice> {
        self.invoices.values().find(|i| {
            i.is_active && i.appointment_id == appointment_id && Some(i.invoice_id) != except
        })
    }

    fn active_gateway_payment(&self, invoice_id: Uuid, except: Option<Uuid>) -> Option<&Payment> {
        self.payments.values().find(|p| {
            p.is_active
                && p.invoice_id == invoice_id
                && p.method.is_gateway()
                && Some(p.payment_id) != except
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    // 0 = off; n = the n-th write from now fails
    fault: Arc<AtomicUsize>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_medicine(&self, name: &str, unit: &str, price: i64) -> Uuid {
        let medicine_id = Uuid::new_v4();
        self.state.lock().await.medicines.insert(
            medicine_id,
            MedicineRow {
                medicine_id,
                name: name.to_string(),
                unit: unit.to_string(),
                price,
                is_active: true,
            },
        );
        medicine_id
    }

    /// Inserts a generic cascading entity (patient, employee, appointment,
    /// user account, payroll, purchase transaction).
    pub async fn add_entity(
        &self,
        kind: EntityKind,
        links: &[(&'static str, Uuid)],
        status: Option<i16>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.entities.insert(
            (kind, id),
            EntityRow {
                is_active: true,
                status,
                links: links.iter().copied().collect(),
            },
        );
        id
    }

    pub async fn add_medical_record(
        &self,
        patient_id: Uuid,
        appointment_id: Option<Uuid>,
        doctor_id: Option<Uuid>,
        prescriptions: Vec<Prescription>,
    ) -> Uuid {
        let medical_record_id = Uuid::new_v4();
        self.state.lock().await.records.insert(
            medical_record_id,
            StoredRecord {
                record: MedicalRecord {
                    medical_record_id,
                    patient_id,
                    appointment_id,
                    is_active: true,
                    prescriptions,
                },
                doctor_id,
            },
        );
        medical_record_id
    }

    pub async fn add_session(&self, token_hash: &str, user_id: Uuid, role: Role) {
        self.state
            .lock()
            .await
            .sessions
            .insert(token_hash.to_string(), SessionActor { user_id, role });
    }
}

#[cfg(test)]
impl MemoryLedger {
    /// Makes the `n`-th write performed from now on fail with a store error.
    pub fn fail_after_writes(&self, n: usize) {
        self.fault.store(n, Ordering::SeqCst);
    }

    pub async fn add_invoice(&self, patient_id: Uuid, appointment_id: Uuid, total_amount: i64) -> Uuid {
        let invoice_id = Uuid::new_v4();
        self.state.lock().await.invoices.insert(
            invoice_id,
            Invoice {
                invoice_id,
                patient_id,
                appointment_id,
                total_amount,
                status: InvoiceStatus::Unpaid,
                is_active: true,
                created_at: Utc::now(),
            },
        );
        invoice_id
    }

    pub async fn batch(&self, batch_id: Uuid) -> Option<MedicineBatch> {
        self.state.lock().await.batches.get(&batch_id).cloned()
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> Option<Invoice> {
        self.state.lock().await.invoices.get(&invoice_id).cloned()
    }

    pub async fn payments_of(&self, invoice_id: Uuid) -> Vec<Payment> {
        self.state
            .lock()
            .await
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id)
            .cloned()
            .collect()
    }

    pub async fn head(&self, kind: EntityKind, id: Uuid) -> Option<EntityHead> {
        self.state.lock().await.head(kind, id)
    }

    pub async fn invoice_count(&self) -> usize {
        self.state.lock().await.invoices.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            fault: self.fault.clone(),
        }))
    }

    async fn session_actor(&self, token_hash: &str) -> Result<Option<SessionActor>, LedgerError> {
        Ok(self.state.lock().await.sessions.get(token_hash).cloned())
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<LedgerState>,
    work: LedgerState,
    fault: Arc<AtomicUsize>,
}

impl MemoryTx {
    fn write(&self) -> Result<(), LedgerError> {
        let prev = self
            .fault
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev == 1 {
            return Err(LedgerError::Store("injected write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let MemoryTx { mut guard, work, .. } = *self;
        *guard = work;
        Ok(())
    }

    async fn medicine(&mut self, medicine_id: Uuid) -> Result<Option<MedicineRow>, LedgerError> {
        Ok(self.work.medicines.get(&medicine_id).cloned())
    }

    async fn lock_batches(
        &mut self,
        medicine_id: Uuid,
        window: ExpiryWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<MedicineBatch>, LedgerError> {
        let mut batches: Vec<MedicineBatch> = self
            .work
            .batches
            .values()
            .filter(|b| b.medicine_id == medicine_id && b.is_active && b.remaining > 0)
            .filter(|b| match window {
                ExpiryWindow::Fresh => b.expiry_date >= now,
                ExpiryWindow::Expired => b.expiry_date < now,
            })
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.expiry_date, b.received_date, b.seq));
        Ok(batches)
    }

    async fn set_batch_remaining(&mut self, batch_id: Uuid, remaining: i32) -> Result<(), LedgerError> {
        self.write()?;
        let batch = self
            .work
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| LedgerError::not_found("batch not found"))?;
        if remaining < 0 || remaining > batch.quantity {
            return Err(LedgerError::Store(format!(
                "remaining {remaining} out of range for batch {batch_id}"
            )));
        }
        batch.remaining = remaining;
        batch.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_batch(&mut self, new: &NewBatch) -> Result<MedicineBatch, LedgerError> {
        self.write()?;
        self.work.next_seq += 1;
        let batch = MedicineBatch {
            batch_id: Uuid::new_v4(),
            seq: self.work.next_seq,
            medicine_id: new.medicine_id,
            supplier: new.supplier.clone(),
            batch_code: new.batch_code.clone(),
            quantity: new.quantity,
            remaining: new.quantity,
            unit_cost: new.unit_cost,
            expiry_date: new.expiry_date,
            received_date: new.received_date,
            received_by: new.received_by,
            is_active: true,
            updated_at: Utc::now(),
        };
        self.work.batches.insert(batch.batch_id, batch.clone());
        Ok(batch)
    }

    async fn medical_record(&mut self, record_id: Uuid) -> Result<Option<MedicalRecord>, LedgerError> {
        Ok(self.work.records.get(&record_id).map(|r| r.record.clone()))
    }

    async fn active_invoice_for_appointment(
        &mut self,
        appointment_id: Uuid,
    ) -> Result<Option<Invoice>, LedgerError> {
        Ok(self.work.active_invoice_for(appointment_id, None).cloned())
    }

    async fn insert_invoice(&mut self, new: &NewInvoice) -> Result<Invoice, LedgerError> {
        self.write()?;
        if self.work.active_invoice_for(new.appointment_id, None).is_some() {
            return Err(LedgerError::Conflict(
                "duplicate active invoice for appointment".into(),
            ));
        }
        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            patient_id: new.patient_id,
            appointment_id: new.appointment_id,
            total_amount: new.total_amount,
            status: InvoiceStatus::Unpaid,
            is_active: true,
            created_at: Utc::now(),
        };
        self.work.invoices.insert(invoice.invoice_id, invoice.clone());
        Ok(invoice)
    }

    async fn lock_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, LedgerError> {
        Ok(self.work.invoices.get(&invoice_id).cloned())
    }

    async fn set_invoice_status(&mut self, invoice_id: Uuid, status: InvoiceStatus) -> Result<(), LedgerError> {
        self.write()?;
        let invoice = self
            .work
            .invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| LedgerError::not_found("invoice not found"))?;
        invoice.status = status;
        Ok(())
    }

    async fn payment(&mut self, payment_id: Uuid) -> Result<Option<Payment>, LedgerError> {
        Ok(self.work.payments.get(&payment_id).cloned())
    }

    async fn active_payments(&mut self, invoice_id: Uuid) -> Result<Vec<Payment>, LedgerError> {
        Ok(self
            .work
            .payments
            .values()
            .filter(|p| p.invoice_id == invoice_id && p.is_active)
            .cloned()
            .collect())
    }

    async fn insert_payment(&mut self, new: &NewPayment) -> Result<Payment, LedgerError> {
        self.write()?;
        if new.method.is_gateway() && self.work.active_gateway_payment(new.invoice_id, None).is_some() {
            return Err(LedgerError::Conflict(
                "duplicate active gateway payment for invoice".into(),
            ));
        }
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            invoice_id: new.invoice_id,
            method: new.method,
            amount: new.amount,
            paid_at: new.paid_at,
            is_active: true,
        };
        self.work.payments.insert(payment.payment_id, payment.clone());
        Ok(payment)
    }

    async fn set_payment_amount(&mut self, payment_id: Uuid, amount: i64) -> Result<(), LedgerError> {
        self.write()?;
        let payment = self
            .work
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| LedgerError::not_found("payment not found"))?;
        payment.amount = amount;
        Ok(())
    }

    async fn set_payment_active(&mut self, payment_id: Uuid, active: bool) -> Result<(), LedgerError> {
        self.set_active(EntityKind::Payment, &[payment_id], active).await?;
        Ok(())
    }

    async fn patient_login(&mut self, patient_id: Uuid) -> Result<Option<Uuid>, LedgerError> {
        Ok(self
            .work
            .entities
            .iter()
            .find(|((kind, _), row)| {
                *kind == EntityKind::UserAccount
                    && row.is_active
                    && row.links.get("patient_id") == Some(&patient_id)
            })
            .map(|((_, id), _)| *id))
    }

    async fn entity_head(&mut self, kind: EntityKind, id: Uuid) -> Result<Option<EntityHead>, LedgerError> {
        Ok(self.work.head(kind, id))
    }

    async fn dependents(&mut self, edge: &Edge, parent_id: Uuid) -> Result<Vec<EntityHead>, LedgerError> {
        Ok(self
            .work
            .ids_of(edge.child)
            .into_iter()
            .filter(|id| self.work.link(edge.child, *id, edge.link) == Some(parent_id))
            .filter_map(|id| self.work.head(edge.child, id))
            .collect())
    }

    async fn set_active(&mut self, kind: EntityKind, ids: &[Uuid], active: bool) -> Result<u64, LedgerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.write()?;
        if active {
            // mirror the partial unique indexes of the Postgres schema
            for id in ids {
                let clash = match kind {
                    EntityKind::Invoice => self
                        .work
                        .invoices
                        .get(id)
                        .filter(|i| !i.is_active)
                        .and_then(|i| self.work.active_invoice_for(i.appointment_id, Some(i.invoice_id)))
                        .is_some(),
                    EntityKind::Payment => self
                        .work
                        .payments
                        .get(id)
                        .filter(|p| !p.is_active && p.method.is_gateway())
                        .and_then(|p| self.work.active_gateway_payment(p.invoice_id, Some(p.payment_id)))
                        .is_some(),
                    _ => false,
                };
                if clash {
                    return Err(LedgerError::Conflict(format!(
                        "reactivating {kind} {id} violates a uniqueness rule"
                    )));
                }
            }
        }
        let mut n = 0;
        for id in ids {
            if self.work.flip(kind, *id, active) {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn hard_delete(&mut self, kind: EntityKind, ids: &[Uuid]) -> Result<u64, LedgerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.write()?;
        let mut n = 0;
        for id in ids {
            if self.work.remove(kind, *id) {
                n += 1;
            }
        }
        Ok(n)
    }
}

/// Seeds a tiny clinic for `LEDGER_STORE=memory` runs: one admin session, one
/// medicine and a prescribed medical record, whose id is returned.
pub async fn seed_demo(ledger: &MemoryLedger, token_hash: &str) -> Uuid {
    let admin_user = ledger.add_entity(EntityKind::UserAccount, &[], None).await;
    ledger.add_session(token_hash, admin_user, Role::Admin).await;

    let paracetamol = ledger.add_medicine("Paracetamol 500mg", "tablet", 2_000).await;
    let patient = ledger.add_entity(EntityKind::Patient, &[], None).await;
    let doctor = ledger.add_entity(EntityKind::Employee, &[], None).await;
    let appointment = ledger
        .add_entity(
            EntityKind::Appointment,
            &[("patient_id", patient), ("doctor_id", doctor)],
            Some(0),
        )
        .await;
    ledger
        .add_medical_record(
            patient,
            Some(appointment),
            Some(doctor),
            vec![Prescription {
                medicine_id: paracetamol,
                quantity: 10,
            }],
        )
        .await
}
