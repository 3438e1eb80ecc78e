use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::billing::BillingEngine;
use crate::gateway::VnPay;
use crate::inventory::InventoryEngine;
use crate::ledger::LedgerStore;
use crate::lifecycle::LifecycleManager;
use crate::notify::NotificationHub;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub inventory: InventoryEngine,
    pub billing: BillingEngine,
    pub lifecycle: LifecycleManager,
    pub hub: NotificationHub,
    pub vnpay: Arc<VnPay>,
    pub frontend_url: String,
    pub conflict_retries: u32,
}

/* -------------------------
   Inventory rows
--------------------------*/

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MedicineRow {
    pub medicine_id: Uuid,
    pub name: String,
    pub unit: String,
    /// Unit sale price in VND.
    pub price: i64,
    pub is_active: bool,
}

/// One received lot of a medicine. `remaining` only moves through the
/// deduction engine and always stays within `0..=quantity`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MedicineBatch {
    pub batch_id: Uuid,
    /// Storage insertion id, last FEFO tie-break.
    pub seq: i64,
    pub medicine_id: Uuid,
    pub supplier: Option<String>,
    pub batch_code: String,
    pub quantity: i32,
    pub remaining: i32,
    pub unit_cost: i64,
    pub expiry_date: DateTime<Utc>,
    pub received_date: DateTime<Utc>,
    pub received_by: Option<Uuid>,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBatch {
    pub medicine_id: Uuid,
    pub supplier: Option<String>,
    pub batch_code: String,
    pub quantity: i32,
    pub unit_cost: i64,
    pub expiry_date: DateTime<Utc>,
    pub received_date: DateTime<Utc>,
    pub received_by: Option<Uuid>,
}

/// Which side of `now` a batch query looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryWindow {
    /// `expiry_date >= now`
    Fresh,
    /// `expiry_date < now`
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Prescription {
    pub medicine_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MedicalRecord {
    pub medical_record_id: Uuid,
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub is_active: bool,
    pub prescriptions: Vec<Prescription>,
}

/* -------------------------
   Billing rows
--------------------------*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
pub enum InvoiceStatus {
    Unpaid = 0,
    Partial = 1,
    Paid = 2,
}

impl InvoiceStatus {
    /// The only way an invoice status is ever derived: from the sum of its
    /// active payments against the fixed total.
    pub fn from_amounts(paid: i64, total: i64) -> Self {
        if paid >= total {
            InvoiceStatus::Paid
        } else if paid > 0 {
            InvoiceStatus::Partial
        } else {
            InvoiceStatus::Unpaid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
pub enum PaymentMethod {
    Cash = 0,
    Card = 1,
    BankTransfer = 2,
    #[serde(rename = "VNPay")]
    VnPay = 3,
}

impl PaymentMethod {
    /// Gateway-originated payments are limited to one active row per invoice.
    pub fn is_gateway(self) -> bool {
        matches!(self, PaymentMethod::VnPay)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub patient_id: Uuid,
    pub appointment_id: Uuid,
    pub total_amount: i64,
    pub status: InvoiceStatus,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub patient_id: Uuid,
    pub appointment_id: Uuid,
    pub total_amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub method: PaymentMethod,
    pub amount: i64,
    pub paid_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub invoice_id: Uuid,
    pub method: PaymentMethod,
    pub amount: i64,
    pub paid_at: DateTime<Utc>,
}

/* -------------------------
   Lifecycle
--------------------------*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Employee,
    Appointment,
    MedicalRecord,
    UserAccount,
    Invoice,
    Payment,
    Payroll,
    Medicine,
    MedicineBatch,
    PurchaseTransaction,
}

impl EntityKind {
    pub const ALL: [EntityKind; 11] = [
        EntityKind::Patient,
        EntityKind::Employee,
        EntityKind::Appointment,
        EntityKind::MedicalRecord,
        EntityKind::UserAccount,
        EntityKind::Invoice,
        EntityKind::Payment,
        EntityKind::Payroll,
        EntityKind::Medicine,
        EntityKind::MedicineBatch,
        EntityKind::PurchaseTransaction,
    ];

    /// Financial and stock records are kept for audit: a hard cascade only
    /// deactivates them.
    pub fn is_audit_retained(self) -> bool {
        matches!(
            self,
            EntityKind::Invoice | EntityKind::Payment | EntityKind::MedicineBatch
        )
    }

    pub fn allows_hard_delete(self) -> bool {
        matches!(
            self,
            EntityKind::Patient | EntityKind::Employee | EntityKind::Medicine
        )
    }

    /// Path segment used by the HTTP surface.
    pub fn from_path(s: &str) -> Option<Self> {
        match s {
            "patients" => Some(EntityKind::Patient),
            "employees" => Some(EntityKind::Employee),
            "appointments" => Some(EntityKind::Appointment),
            "invoices" => Some(EntityKind::Invoice),
            "medicines" => Some(EntityKind::Medicine),
            "users" => Some(EntityKind::UserAccount),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Patient => "patient",
            EntityKind::Employee => "employee",
            EntityKind::Appointment => "appointment",
            EntityKind::MedicalRecord => "medical_record",
            EntityKind::UserAccount => "user_account",
            EntityKind::Invoice => "invoice",
            EntityKind::Payment => "payment",
            EntityKind::Payroll => "payroll",
            EntityKind::Medicine => "medicine",
            EntityKind::MedicineBatch => "medicine_batch",
            EntityKind::PurchaseTransaction => "purchase_transaction",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum AppointmentStatus {
    Scheduled = 0,
    Completed = 1,
    Cancelled = 2,
}

impl AppointmentStatus {
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(AppointmentStatus::Scheduled),
            1 => Some(AppointmentStatus::Completed),
            2 => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }
}

/// Minimal view of any cascading entity: enough to decide whether to touch it.
#[derive(Debug, Clone, FromRow)]
pub struct EntityHead {
    pub id: Uuid,
    pub is_active: bool,
    /// Only populated for appointments.
    pub status: Option<i16>,
}

/* -------------------------
   Actors
--------------------------*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "smallint")]
#[repr(i16)]
pub enum Role {
    Admin = 0,
    Doctor = 1,
    Nurse = 2,
    Receptionist = 3,
    Accountant = 4,
    Pharmacist = 5,
    Patient = 6,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Doctor => "Doctor",
            Role::Nurse => "Nurse",
            Role::Receptionist => "Receptionist",
            Role::Accountant => "Accountant",
            Role::Pharmacist => "Pharmacist",
            Role::Patient => "Patient",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionActor {
    pub user_id: Uuid,
    pub role: Role,
}

/* -------------------------
   API DTOs
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_paid_amount() {
        assert_eq!(InvoiceStatus::from_amounts(0, 500_000), InvoiceStatus::Unpaid);
        assert_eq!(InvoiceStatus::from_amounts(200_000, 500_000), InvoiceStatus::Partial);
        assert_eq!(InvoiceStatus::from_amounts(500_000, 500_000), InvoiceStatus::Paid);
        assert_eq!(InvoiceStatus::from_amounts(600_000, 500_000), InvoiceStatus::Paid);
    }

    #[test]
    fn only_people_and_medicines_can_be_hard_deleted() {
        let hard: Vec<_> = EntityKind::ALL
            .into_iter()
            .filter(|k| k.allows_hard_delete())
            .collect();
        assert_eq!(
            hard,
            vec![EntityKind::Patient, EntityKind::Employee, EntityKind::Medicine]
        );
        assert!(!EntityKind::Invoice.allows_hard_delete());
        assert!(EntityKind::Payment.is_audit_retained());
    }
}
