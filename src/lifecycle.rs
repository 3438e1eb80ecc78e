//! Soft delete, hard delete and restore across the entity graph.
//!
//! Ownership is an explicit adjacency table ([`CASCADE_EDGES`]). A cascade
//! reaches the root's direct dependents only: deleting a doctor deactivates
//! their appointments, not the invoices other patients owe for them.
//! `Owned` edges form a DAG that orders the writes; `Reverse` edges are the
//! links from a user account to the person it logs in for.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::billing;
use crate::ledger::{LedgerError, LedgerStore, LedgerTx};
use crate::models::{AppointmentStatus, EntityKind, Payment, Role};
use crate::notify::{self, Notification, NotificationSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeMode {
    Owned,
    Reverse,
}

/// `child.link == parent.id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub parent: EntityKind,
    pub child: EntityKind,
    pub link: &'static str,
    pub mode: EdgeMode,
}

const fn edge(parent: EntityKind, child: EntityKind, link: &'static str) -> Edge {
    Edge {
        parent,
        child,
        link,
        mode: EdgeMode::Owned,
    }
}

const fn reverse(parent: EntityKind, child: EntityKind, link: &'static str) -> Edge {
    Edge {
        parent,
        child,
        link,
        mode: EdgeMode::Reverse,
    }
}

use crate::models::EntityKind as K;

pub const CASCADE_EDGES: &[Edge] = &[
    edge(K::Patient, K::Appointment, "patient_id"),
    edge(K::Patient, K::MedicalRecord, "patient_id"),
    edge(K::Patient, K::UserAccount, "patient_id"),
    edge(K::Patient, K::Invoice, "patient_id"),
    edge(K::Appointment, K::MedicalRecord, "appointment_id"),
    edge(K::Appointment, K::Invoice, "appointment_id"),
    edge(K::Employee, K::Appointment, "doctor_id"),
    edge(K::Employee, K::MedicalRecord, "doctor_id"),
    edge(K::Employee, K::UserAccount, "employee_id"),
    edge(K::Employee, K::Payroll, "employee_id"),
    edge(K::Invoice, K::Payment, "invoice_id"),
    edge(K::Medicine, K::MedicineBatch, "medicine_id"),
    edge(K::Medicine, K::PurchaseTransaction, "medicine_id"),
    reverse(K::UserAccount, K::Employee, "user_id"),
    reverse(K::UserAccount, K::Patient, "user_id"),
];

/// Kinds that may be the root of a delete or restore request.
pub const ROOT_KINDS: [EntityKind; 6] = [
    K::Patient,
    K::Employee,
    K::Appointment,
    K::Invoice,
    K::Medicine,
    K::UserAccount,
];

/// Kahn's algorithm over the `Owned` edges. `None` if they contain a cycle.
pub fn topological_order() -> Option<Vec<EntityKind>> {
    let mut indegree: BTreeMap<EntityKind, usize> = EntityKind::ALL.iter().map(|k| (*k, 0)).collect();
    let owned = || CASCADE_EDGES.iter().filter(|e| e.mode == EdgeMode::Owned);
    for e in owned() {
        *indegree.entry(e.child).or_default() += 1;
    }

    let mut ready: VecDeque<EntityKind> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut order = Vec::with_capacity(indegree.len());
    while let Some(kind) = ready.pop_front() {
        order.push(kind);
        for e in owned().filter(|e| e.parent == kind) {
            if let Some(n) = indegree.get_mut(&e.child) {
                *n -= 1;
                if *n == 0 {
                    ready.push_back(e.child);
                }
            }
        }
    }
    (order.len() == indegree.len()).then_some(order)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeAction {
    SoftDelete,
    HardDelete,
    Restore,
}

#[derive(Debug, Clone, Serialize)]
pub struct CascadeSummary {
    pub root: EntityKind,
    pub root_id: Uuid,
    pub action: CascadeAction,
    /// Rows flipped or removed per kind, root included.
    pub affected: BTreeMap<EntityKind, u64>,
    /// Audit-retained rows a hard delete deactivated instead of removing.
    pub retained: BTreeMap<EntityKind, u64>,
    /// Inactive payments a restore left off because the invoice had no room
    /// for them or already carries an active gateway payment.
    pub skipped: BTreeMap<EntityKind, u64>,
}

impl CascadeSummary {
    pub fn total(&self) -> u64 {
        self.affected.values().sum::<u64>() + self.retained.values().sum::<u64>()
    }
}

#[derive(Clone)]
pub struct LifecycleManager {
    ledger: Arc<dyn LedgerStore>,
    sink: Arc<dyn NotificationSink>,
}

impl LifecycleManager {
    pub fn new(ledger: Arc<dyn LedgerStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { ledger, sink }
    }

    pub async fn delete_cascade(&self, kind: EntityKind, id: Uuid, hard: bool) -> Result<CascadeSummary, LedgerError> {
        if hard && !kind.allows_hard_delete() {
            return Err(LedgerError::Guard(format!("{kind} records cannot be hard deleted")));
        }
        let action = if hard { CascadeAction::HardDelete } else { CascadeAction::SoftDelete };
        let summary = self.run(kind, id, action).await?;

        let verb = if hard { "permanently deleted" } else { "deactivated" };
        notify::emit(
            self.sink.as_ref(),
            Notification::to_role(
                Role::Admin,
                "record_deleted",
                format!("{} {verb}", title_case(kind)),
                format!("{kind} {id} {verb} with {} dependent change(s)", summary.total().saturating_sub(1)),
            )
            .related(kind_label(kind), id),
        );
        Ok(summary)
    }

    pub async fn restore_cascade(&self, kind: EntityKind, id: Uuid) -> Result<CascadeSummary, LedgerError> {
        let summary = self.run(kind, id, CascadeAction::Restore).await?;
        notify::emit(
            self.sink.as_ref(),
            Notification::to_role(
                Role::Admin,
                "record_restored",
                format!("{} restored", title_case(kind)),
                format!("{kind} {id} restored with {} dependent change(s)", summary.total().saturating_sub(1)),
            )
            .related(kind_label(kind), id),
        );
        Ok(summary)
    }

    /// One transaction per id; stops at the first failure, earlier ids stay
    /// committed.
    pub async fn delete_many(&self, kind: EntityKind, ids: &[Uuid], hard: bool) -> Result<Vec<CascadeSummary>, LedgerError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.delete_cascade(kind, *id, hard).await?);
        }
        Ok(out)
    }

    pub async fn restore_many(&self, kind: EntityKind, ids: &[Uuid]) -> Result<Vec<CascadeSummary>, LedgerError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.restore_cascade(kind, *id).await?);
        }
        Ok(out)
    }

    async fn run(&self, kind: EntityKind, id: Uuid, action: CascadeAction) -> Result<CascadeSummary, LedgerError> {
        if !ROOT_KINDS.contains(&kind) {
            return Err(LedgerError::validation(format!("{kind} cannot be deleted or restored directly")));
        }
        let mut tx = self.ledger.begin().await?;

        let root = tx
            .entity_head(kind, id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("{kind} {id} not found")))?;

        if kind == K::Appointment
            && root.status.and_then(AppointmentStatus::from_code) == Some(AppointmentStatus::Completed)
        {
            return Err(LedgerError::Guard(
                "completed appointments cannot be deleted or restored".into(),
            ));
        }

        let mut summary = CascadeSummary {
            root: kind,
            root_id: id,
            action,
            affected: BTreeMap::new(),
            retained: BTreeMap::new(),
            skipped: BTreeMap::new(),
        };

        let target_active = action == CascadeAction::Restore;
        if action != CascadeAction::HardDelete && root.is_active == target_active {
            tracing::debug!(%kind, %id, ?action, "root already in target state");
            return Ok(summary);
        }

        let mut plan = collect_dependents(tx.as_mut(), kind, id, action).await?;
        let order = topological_order().ok_or_else(|| LedgerError::Store("cascade graph has a cycle".into()))?;

        if action == CascadeAction::Restore {
            if let Some(payments) = plan.remove(&K::Payment) {
                restore_payments(tx.as_mut(), &mut summary, &payments).await?;
            }
        }
        // children before parents so hard deletes never orphan a link
        for child_kind in order.iter().rev() {
            let Some(ids) = plan.get(child_kind) else { continue };
            apply(tx.as_mut(), &mut summary, *child_kind, ids, action).await?;
        }
        apply(tx.as_mut(), &mut summary, kind, &[id], action).await?;

        if action == CascadeAction::Restore {
            let mut invoices = plan.remove(&K::Invoice).unwrap_or_default();
            if kind == K::Invoice {
                invoices.push(id);
            }
            for invoice_id in invoices {
                if let Some(invoice) = tx.lock_invoice(invoice_id).await? {
                    billing::settle(tx.as_mut(), &invoice).await?;
                }
            }
        }

        tx.commit().await?;
        tracing::info!(
            %kind,
            %id,
            ?action,
            affected = summary.total(),
            "cascade committed"
        );
        Ok(summary)
    }
}

/// Direct dependents of the root that the action would change.
async fn collect_dependents(
    tx: &mut dyn LedgerTx,
    root_kind: EntityKind,
    root_id: Uuid,
    action: CascadeAction,
) -> Result<BTreeMap<EntityKind, Vec<Uuid>>, LedgerError> {
    let mut plan: BTreeMap<EntityKind, Vec<Uuid>> = BTreeMap::new();
    for e in CASCADE_EDGES.iter().filter(|e| e.parent == root_kind) {
        for child in tx.dependents(e, root_id).await? {
            let touch = match action {
                CascadeAction::SoftDelete => child.is_active,
                CascadeAction::Restore => !child.is_active,
                CascadeAction::HardDelete => true,
            };
            let ids = plan.entry(e.child).or_default();
            if touch && !ids.contains(&child.id) {
                ids.push(child.id);
            }
        }
    }
    plan.retain(|_, ids| !ids.is_empty());
    Ok(plan)
}

/// Reactivates payments one at a time, newest first, while each still fits
/// under its invoice's total and the one-gateway-payment rule. The rest stay
/// inactive and are counted as skipped.
async fn restore_payments(
    tx: &mut dyn LedgerTx,
    summary: &mut CascadeSummary,
    ids: &[Uuid],
) -> Result<(), LedgerError> {
    let mut by_invoice: HashMap<Uuid, Vec<Payment>> = HashMap::new();
    for id in ids {
        if let Some(p) = tx.payment(*id).await?.filter(|p| !p.is_active) {
            by_invoice.entry(p.invoice_id).or_default().push(p);
        }
    }

    for (invoice_id, mut candidates) in by_invoice {
        let Some(invoice) = tx.lock_invoice(invoice_id).await? else { continue };
        let active = tx.active_payments(invoice_id).await?;
        let mut paid: i64 = active.iter().map(|p| p.amount).sum();
        let mut has_gateway = active.iter().any(|p| p.method.is_gateway());

        candidates.sort_by(|a, b| b.paid_at.cmp(&a.paid_at).then(a.payment_id.cmp(&b.payment_id)));
        for p in candidates {
            let fits = p.amount <= invoice.total_amount - paid;
            if !fits || (p.method.is_gateway() && has_gateway) {
                tracing::info!(payment_id = %p.payment_id, %invoice_id, amount = p.amount, "payment left inactive on restore");
                *summary.skipped.entry(K::Payment).or_default() += 1;
                continue;
            }
            tx.set_payment_active(p.payment_id, true).await?;
            paid += p.amount;
            has_gateway |= p.method.is_gateway();
            *summary.affected.entry(K::Payment).or_default() += 1;
        }
    }
    Ok(())
}

async fn apply(
    tx: &mut dyn LedgerTx,
    summary: &mut CascadeSummary,
    kind: EntityKind,
    ids: &[Uuid],
    action: CascadeAction,
) -> Result<(), LedgerError> {
    let n = match action {
        CascadeAction::SoftDelete => tx.set_active(kind, ids, false).await?,
        CascadeAction::Restore => tx.set_active(kind, ids, true).await?,
        CascadeAction::HardDelete if kind.is_audit_retained() => {
            let n = tx.set_active(kind, ids, false).await?;
            if n > 0 {
                *summary.retained.entry(kind).or_default() += n;
            }
            return Ok(());
        }
        CascadeAction::HardDelete => tx.hard_delete(kind, ids).await?,
    };
    if n > 0 {
        *summary.affected.entry(kind).or_default() += n;
    }
    Ok(())
}

fn kind_label(kind: EntityKind) -> &'static str {
    match kind {
        K::Patient => "patient",
        K::Employee => "employee",
        K::Appointment => "appointment",
        K::MedicalRecord => "medical_record",
        K::UserAccount => "user_account",
        K::Invoice => "invoice",
        K::Payment => "payment",
        K::Payroll => "payroll",
        K::Medicine => "medicine",
        K::MedicineBatch => "medicine_batch",
        K::PurchaseTransaction => "purchase_transaction",
    }
}

fn title_case(kind: EntityKind) -> String {
    let label = kind_label(kind).replace('_', " ");
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{BillingEngine, PaymentRequest};
    use crate::ledger::MemoryLedger;
    use crate::models::{InvoiceStatus, PaymentMethod};
    use crate::notify::testing::RecordingSink;

    struct Clinic {
        ledger: MemoryLedger,
        patient: Uuid,
        doctor: Uuid,
        appointment: Uuid,
        record: Uuid,
        invoice: Uuid,
        patient_login: Uuid,
    }

    async fn clinic() -> Clinic {
        let ledger = MemoryLedger::new();
        let patient = ledger.add_entity(K::Patient, &[], None).await;
        let doctor = ledger.add_entity(K::Employee, &[], None).await;
        let appointment = ledger
            .add_entity(K::Appointment, &[("patient_id", patient), ("doctor_id", doctor)], Some(0))
            .await;
        let record = ledger
            .add_medical_record(patient, Some(appointment), Some(doctor), vec![])
            .await;
        let invoice = ledger.add_invoice(patient, appointment, 300_000).await;
        let patient_login = ledger.add_entity(K::UserAccount, &[("patient_id", patient)], None).await;
        Clinic {
            ledger,
            patient,
            doctor,
            appointment,
            record,
            invoice,
            patient_login,
        }
    }

    fn manager(ledger: &MemoryLedger) -> (LifecycleManager, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (LifecycleManager::new(Arc::new(ledger.clone()), sink.clone()), sink)
    }

    async fn active(ledger: &MemoryLedger, kind: EntityKind, id: Uuid) -> bool {
        ledger.head(kind, id).await.map(|h| h.is_active).unwrap_or(false)
    }

    #[test]
    fn descend_edges_form_a_dag() {
        let order = topological_order().expect("cycle in cascade graph");
        let pos = |k: EntityKind| order.iter().position(|x| *x == k).unwrap();
        for e in CASCADE_EDGES.iter().filter(|e| e.mode == EdgeMode::Owned) {
            assert!(pos(e.parent) < pos(e.child), "{} must precede {}", e.parent, e.child);
        }
        assert_eq!(order.len(), EntityKind::ALL.len());
    }

    #[tokio::test]
    async fn soft_delete_patient_reaches_every_dependent() {
        let c = clinic().await;
        let (lm, sink) = manager(&c.ledger);
        let payment = {
            let mut tx = c.ledger.begin().await.unwrap();
            let p = tx
                .insert_payment(&crate::models::NewPayment {
                    invoice_id: c.invoice,
                    method: crate::models::PaymentMethod::Cash,
                    amount: 100_000,
                    paid_at: chrono::Utc::now(),
                })
                .await
                .unwrap();
            tx.commit().await.unwrap();
            p.payment_id
        };

        let summary = lm.delete_cascade(K::Patient, c.patient, false).await.unwrap();

        assert!(!active(&c.ledger, K::Patient, c.patient).await);
        assert!(!active(&c.ledger, K::Appointment, c.appointment).await);
        assert!(!active(&c.ledger, K::MedicalRecord, c.record).await);
        assert!(!active(&c.ledger, K::Invoice, c.invoice).await);
        assert!(!active(&c.ledger, K::UserAccount, c.patient_login).await);
        // payments hang off the invoice, not the patient
        assert!(active(&c.ledger, K::Payment, payment).await);
        assert_eq!(summary.affected[&K::MedicalRecord], 1);
        assert_eq!(summary.affected[&K::Invoice], 1);
        // the doctor is a parent of the appointment, not a dependent of the patient
        assert!(active(&c.ledger, K::Employee, c.doctor).await);
        assert_eq!(sink.kinds(), vec!["record_deleted"]);

        let restored = lm.restore_cascade(K::Patient, c.patient).await.unwrap();
        assert_eq!(restored.total(), summary.total());
        for (kind, id) in [
            (K::Patient, c.patient),
            (K::Appointment, c.appointment),
            (K::MedicalRecord, c.record),
            (K::Invoice, c.invoice),
            (K::UserAccount, c.patient_login),
        ] {
            assert!(active(&c.ledger, kind, id).await, "{kind} not restored");
        }
        assert_eq!(c.ledger.invoice(c.invoice).await.unwrap().status, InvoiceStatus::Partial);
    }

    fn billing(ledger: &MemoryLedger) -> BillingEngine {
        BillingEngine::new(Arc::new(ledger.clone()), Arc::new(RecordingSink::default()))
    }

    fn cash_at(invoice_id: Uuid, amount: i64, minutes_ago: i64) -> PaymentRequest {
        PaymentRequest {
            invoice_id,
            amount,
            method: PaymentMethod::Cash,
            paid_at: Some(chrono::Utc::now() - chrono::Duration::minutes(minutes_ago)),
        }
    }

    #[tokio::test]
    async fn patient_restore_leaves_voided_payments_voided() {
        let c = clinic().await;
        let (lm, _) = manager(&c.ledger);
        let desk = billing(&c.ledger);
        let voided = desk.create_payment(cash_at(c.invoice, 300_000, 10)).await.unwrap();
        desk.remove_payment(voided.payment.payment_id).await.unwrap();
        desk.create_payment(cash_at(c.invoice, 300_000, 5)).await.unwrap();

        lm.delete_cascade(K::Patient, c.patient, false).await.unwrap();
        lm.restore_cascade(K::Patient, c.patient).await.unwrap();

        let paid: i64 = c
            .ledger
            .payments_of(c.invoice)
            .await
            .iter()
            .filter(|p| p.is_active)
            .map(|p| p.amount)
            .sum();
        assert_eq!(paid, 300_000);
        assert!(!active(&c.ledger, K::Payment, voided.payment.payment_id).await);
        assert_eq!(c.ledger.invoice(c.invoice).await.unwrap().status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn invoice_restore_never_overpays() {
        let c = clinic().await;
        let (lm, _) = manager(&c.ledger);
        let desk = billing(&c.ledger);
        let voided = desk.create_payment(cash_at(c.invoice, 300_000, 10)).await.unwrap();
        desk.remove_payment(voided.payment.payment_id).await.unwrap();
        let kept = desk.create_payment(cash_at(c.invoice, 300_000, 5)).await.unwrap();

        let deleted = lm.delete_cascade(K::Invoice, c.invoice, false).await.unwrap();
        assert_eq!(deleted.affected[&K::Payment], 1);
        assert!(!active(&c.ledger, K::Payment, kept.payment.payment_id).await);

        let restored = lm.restore_cascade(K::Invoice, c.invoice).await.unwrap();

        assert_eq!(restored.affected[&K::Payment], 1);
        assert_eq!(restored.skipped[&K::Payment], 1);
        assert!(active(&c.ledger, K::Payment, kept.payment.payment_id).await);
        assert!(!active(&c.ledger, K::Payment, voided.payment.payment_id).await);
        let invoice = c.ledger.invoice(c.invoice).await.unwrap();
        assert!(invoice.is_active);
        assert_eq!(invoice.status, InvoiceStatus::Paid);
    }

    #[tokio::test]
    async fn deleting_a_doctor_spares_patient_finances() {
        let c = clinic().await;
        let (lm, _) = manager(&c.ledger);
        let paid = billing(&c.ledger)
            .create_payment(cash_at(c.invoice, 100_000, 1))
            .await
            .unwrap();

        let summary = lm.delete_cascade(K::Employee, c.doctor, false).await.unwrap();

        assert!(!active(&c.ledger, K::Appointment, c.appointment).await);
        assert!(!active(&c.ledger, K::MedicalRecord, c.record).await);
        assert!(active(&c.ledger, K::Invoice, c.invoice).await);
        assert!(active(&c.ledger, K::Payment, paid.payment.payment_id).await);
        assert!(!summary.affected.contains_key(&K::Invoice));
        assert!(!summary.affected.contains_key(&K::Payment));
    }

    #[tokio::test]
    async fn other_patients_are_untouched() {
        let c = clinic().await;
        let other = c.ledger.add_entity(K::Patient, &[], None).await;
        let other_appt = c
            .ledger
            .add_entity(K::Appointment, &[("patient_id", other), ("doctor_id", c.doctor)], Some(0))
            .await;
        let other_invoice = c.ledger.add_invoice(other, other_appt, 50_000).await;
        let (lm, _) = manager(&c.ledger);

        lm.delete_cascade(K::Patient, c.patient, false).await.unwrap();

        assert!(active(&c.ledger, K::Patient, other).await);
        assert!(active(&c.ledger, K::Appointment, other_appt).await);
        assert!(active(&c.ledger, K::Invoice, other_invoice).await);
    }

    #[tokio::test]
    async fn repeated_delete_is_a_no_op() {
        let c = clinic().await;
        let (lm, _) = manager(&c.ledger);
        lm.delete_cascade(K::Patient, c.patient, false).await.unwrap();
        let again = lm.delete_cascade(K::Patient, c.patient, false).await.unwrap();
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn completed_appointment_is_guarded() {
        let c = clinic().await;
        let done = c
            .ledger
            .add_entity(K::Appointment, &[("patient_id", c.patient)], Some(AppointmentStatus::Completed as i16))
            .await;
        let (lm, sink) = manager(&c.ledger);

        let err = lm.delete_cascade(K::Appointment, done, false).await.unwrap_err();
        assert!(matches!(err, LedgerError::Guard(_)));
        assert!(active(&c.ledger, K::Appointment, done).await);
        assert!(sink.kinds().is_empty());

        // as a dependent it still follows the patient
        lm.delete_cascade(K::Patient, c.patient, false).await.unwrap();
        assert!(!active(&c.ledger, K::Appointment, done).await);
    }

    #[tokio::test]
    async fn missing_root_is_not_found() {
        let c = clinic().await;
        let (lm, _) = manager(&c.ledger);
        let err = lm.restore_cascade(K::Employee, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn hard_delete_keeps_financial_rows() {
        let c = clinic().await;
        let (lm, _) = manager(&c.ledger);

        let summary = lm.delete_cascade(K::Patient, c.patient, true).await.unwrap();

        assert!(c.ledger.head(K::Patient, c.patient).await.is_none());
        assert!(c.ledger.head(K::Appointment, c.appointment).await.is_none());
        assert!(c.ledger.head(K::MedicalRecord, c.record).await.is_none());
        let invoice = c.ledger.head(K::Invoice, c.invoice).await.expect("invoice kept");
        assert!(!invoice.is_active);
        assert_eq!(summary.retained[&K::Invoice], 1);
        assert_eq!(summary.action, CascadeAction::HardDelete);
    }

    #[tokio::test]
    async fn hard_delete_is_limited_to_people_and_medicines() {
        let c = clinic().await;
        let (lm, _) = manager(&c.ledger);
        let err = lm.delete_cascade(K::Invoice, c.invoice, true).await.unwrap_err();
        assert!(matches!(err, LedgerError::Guard(_)));
        assert!(active(&c.ledger, K::Invoice, c.invoice).await);
    }

    #[tokio::test]
    async fn user_account_root_reaches_its_person_only() {
        let c = clinic().await;
        let staff_login = c.ledger.add_entity(K::UserAccount, &[("employee_id", c.doctor)], None).await;
        let doctor_user = c
            .ledger
            .add_entity(K::Employee, &[("user_id", staff_login)], None)
            .await;
        let (lm, _) = manager(&c.ledger);

        lm.delete_cascade(K::UserAccount, staff_login, false).await.unwrap();

        assert!(!active(&c.ledger, K::UserAccount, staff_login).await);
        assert!(!active(&c.ledger, K::Employee, doctor_user).await);
        // the reverse hop does not continue into the employee's own dependents
        assert!(active(&c.ledger, K::Appointment, c.appointment).await);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_the_whole_cascade() {
        let c = clinic().await;
        let (lm, sink) = manager(&c.ledger);
        c.ledger.fail_after_writes(3);

        let err = lm.delete_cascade(K::Patient, c.patient, false).await.unwrap_err();
        assert!(matches!(err, LedgerError::Store(_)));
        for (kind, id) in [
            (K::Patient, c.patient),
            (K::Appointment, c.appointment),
            (K::MedicalRecord, c.record),
            (K::Invoice, c.invoice),
            (K::UserAccount, c.patient_login),
        ] {
            assert!(active(&c.ledger, kind, id).await, "{kind} changed despite rollback");
        }
        assert!(sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn bulk_delete_runs_each_root() {
        let c = clinic().await;
        let second = c.ledger.add_entity(K::Patient, &[], None).await;
        let (lm, _) = manager(&c.ledger);
        let out = lm.delete_many(K::Patient, &[c.patient, second], false).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(!active(&c.ledger, K::Patient, second).await);
        lm.restore_many(K::Patient, &[second]).await.unwrap();
        assert!(active(&c.ledger, K::Patient, second).await);
    }
}
