//! Postgres ledger. Rows the engines decide on are read `FOR UPDATE`, so two
//! deductions of the same medicine or two payments on the same invoice queue
//! behind each other instead of racing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{LedgerError, LedgerStore, LedgerTx};
use crate::lifecycle::Edge;
use crate::models::{
    EntityHead, EntityKind, ExpiryWindow, Invoice, InvoiceStatus, MedicalRecord, MedicineBatch,
    MedicineRow, NewBatch, NewInvoice, NewPayment, Payment, Prescription, SessionActor,
};

/// `(table, primary key column)` per kind.
fn table_of(kind: EntityKind) -> (&'static str, &'static str) {
    match kind {
        EntityKind::Patient => ("patients", "patient_id"),
        EntityKind::Employee => ("employees", "employee_id"),
        EntityKind::Appointment => ("appointments", "appointment_id"),
        EntityKind::MedicalRecord => ("medical_records", "medical_record_id"),
        EntityKind::UserAccount => ("user_accounts", "user_id"),
        EntityKind::Invoice => ("invoices", "invoice_id"),
        EntityKind::Payment => ("payments", "payment_id"),
        EntityKind::Payroll => ("payrolls", "payroll_id"),
        EntityKind::Medicine => ("medicines", "medicine_id"),
        EntityKind::MedicineBatch => ("medicine_batches", "batch_id"),
        EntityKind::PurchaseTransaction => ("purchase_transactions", "purchase_transaction_id"),
    }
}

fn status_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Appointment => "status",
        _ => "NULL::smallint",
    }
}

const BATCH_COLUMNS: &str = r#"
    batch_id, seq, medicine_id, supplier, batch_code, quantity, remaining,
    unit_cost, expiry_date, received_date, received_by, is_active, updated_at
"#;

const INVOICE_COLUMNS: &str =
    "invoice_id, patient_id, appointment_id, total_amount, status, is_active, created_at";

const PAYMENT_COLUMNS: &str = "payment_id, invoice_id, method, amount, paid_at, is_active";

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn session_actor(&self, token_hash: &str) -> Result<Option<SessionActor>, LedgerError> {
        let actor = sqlx::query_as::<_, SessionActor>(
            r#"
            SELECT st.user_id, u.role
            FROM session_tokens st
            JOIN user_accounts u ON u.user_id = st.user_id
            WHERE st.token_hash = $1
              AND st.revoked_at IS NULL
              AND st.expires_at > now()
              AND u.is_active = true
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    medical_record_id: Uuid,
    patient_id: Uuid,
    appointment_id: Option<Uuid>,
    is_active: bool,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn medicine(&mut self, medicine_id: Uuid) -> Result<Option<MedicineRow>, LedgerError> {
        let row = sqlx::query_as::<_, MedicineRow>(
            "SELECT medicine_id, name, unit, price, is_active FROM medicines WHERE medicine_id = $1",
        )
        .bind(medicine_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_batches(
        &mut self,
        medicine_id: Uuid,
        window: ExpiryWindow,
        now: DateTime<Utc>,
    ) -> Result<Vec<MedicineBatch>, LedgerError> {
        let side = match window {
            ExpiryWindow::Fresh => "expiry_date >= $2",
            ExpiryWindow::Expired => "expiry_date < $2",
        };
        let sql = format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM medicine_batches
            WHERE medicine_id = $1
              AND is_active = true
              AND remaining > 0
              AND {side}
            ORDER BY expiry_date ASC, received_date ASC, seq ASC
            FOR UPDATE
            "#
        );
        let rows = sqlx::query_as::<_, MedicineBatch>(&sql)
            .bind(medicine_id)
            .bind(now)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn set_batch_remaining(&mut self, batch_id: Uuid, remaining: i32) -> Result<(), LedgerError> {
        let res = sqlx::query(
            r#"
            UPDATE medicine_batches
            SET remaining = $2, updated_at = now()
            WHERE batch_id = $1
              AND $2 BETWEEN 0 AND quantity
            "#,
        )
        .bind(batch_id)
        .bind(remaining)
        .execute(&mut *self.tx)
        .await?;
        if res.rows_affected() != 1 {
            return Err(LedgerError::Store(format!(
                "remaining {remaining} rejected for batch {batch_id}"
            )));
        }
        Ok(())
    }

    async fn insert_batch(&mut self, batch: &NewBatch) -> Result<MedicineBatch, LedgerError> {
        let sql = format!(
            r#"
            INSERT INTO medicine_batches
              (batch_id, medicine_id, supplier, batch_code, quantity, remaining,
               unit_cost, expiry_date, received_date, received_by)
            VALUES ($1, $2, $3, $4, $5, $5, $6, $7, $8, $9)
            RETURNING {BATCH_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, MedicineBatch>(&sql)
            .bind(Uuid::new_v4())
            .bind(batch.medicine_id)
            .bind(&batch.supplier)
            .bind(&batch.batch_code)
            .bind(batch.quantity)
            .bind(batch.unit_cost)
            .bind(batch.expiry_date)
            .bind(batch.received_date)
            .bind(batch.received_by)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn medical_record(&mut self, record_id: Uuid) -> Result<Option<MedicalRecord>, LedgerError> {
        let Some(row) = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT medical_record_id, patient_id, appointment_id, is_active
            FROM medical_records
            WHERE medical_record_id = $1
            "#,
        )
        .bind(record_id)
        .fetch_optional(&mut *self.tx)
        .await?
        else {
            return Ok(None);
        };

        let prescriptions = sqlx::query_as::<_, Prescription>(
            r#"
            SELECT medicine_id, quantity
            FROM prescriptions
            WHERE medical_record_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(record_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(Some(MedicalRecord {
            medical_record_id: row.medical_record_id,
            patient_id: row.patient_id,
            appointment_id: row.appointment_id,
            is_active: row.is_active,
            prescriptions,
        }))
    }

    async fn active_invoice_for_appointment(
        &mut self,
        appointment_id: Uuid,
    ) -> Result<Option<Invoice>, LedgerError> {
        let sql = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE appointment_id = $1 AND is_active = true"
        );
        let row = sqlx::query_as::<_, Invoice>(&sql)
            .bind(appointment_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn insert_invoice(&mut self, invoice: &NewInvoice) -> Result<Invoice, LedgerError> {
        let sql = format!(
            r#"
            INSERT INTO invoices (invoice_id, patient_id, appointment_id, total_amount, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {INVOICE_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, Invoice>(&sql)
            .bind(Uuid::new_v4())
            .bind(invoice.patient_id)
            .bind(invoice.appointment_id)
            .bind(invoice.total_amount)
            .bind(InvoiceStatus::Unpaid)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn lock_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, LedgerError> {
        let sql = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, Invoice>(&sql)
            .bind(invoice_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn set_invoice_status(&mut self, invoice_id: Uuid, status: InvoiceStatus) -> Result<(), LedgerError> {
        sqlx::query("UPDATE invoices SET status = $2, updated_at = now() WHERE invoice_id = $1")
            .bind(invoice_id)
            .bind(status)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn payment(&mut self, payment_id: Uuid) -> Result<Option<Payment>, LedgerError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1");
        let row = sqlx::query_as::<_, Payment>(&sql)
            .bind(payment_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn active_payments(&mut self, invoice_id: Uuid) -> Result<Vec<Payment>, LedgerError> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE invoice_id = $1 AND is_active = true ORDER BY paid_at ASC"
        );
        let rows = sqlx::query_as::<_, Payment>(&sql)
            .bind(invoice_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> Result<Payment, LedgerError> {
        let sql = format!(
            r#"
            INSERT INTO payments (payment_id, invoice_id, method, amount, paid_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {PAYMENT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, Payment>(&sql)
            .bind(Uuid::new_v4())
            .bind(payment.invoice_id)
            .bind(payment.method)
            .bind(payment.amount)
            .bind(payment.paid_at)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn set_payment_amount(&mut self, payment_id: Uuid, amount: i64) -> Result<(), LedgerError> {
        sqlx::query("UPDATE payments SET amount = $2, updated_at = now() WHERE payment_id = $1")
            .bind(payment_id)
            .bind(amount)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn set_payment_active(&mut self, payment_id: Uuid, active: bool) -> Result<(), LedgerError> {
        self.set_active(EntityKind::Payment, &[payment_id], active).await?;
        Ok(())
    }

    async fn patient_login(&mut self, patient_id: Uuid) -> Result<Option<Uuid>, LedgerError> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT user_id
            FROM user_accounts
            WHERE patient_id = $1 AND is_active = true
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(patient_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(user_id)
    }

    async fn entity_head(&mut self, kind: EntityKind, id: Uuid) -> Result<Option<EntityHead>, LedgerError> {
        let (table, pk) = table_of(kind);
        let sql = format!(
            "SELECT {pk} AS id, is_active, {} AS status FROM {table} WHERE {pk} = $1 FOR UPDATE",
            status_column(kind)
        );
        let row = sqlx::query_as::<_, EntityHead>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn dependents(&mut self, edge: &Edge, parent_id: Uuid) -> Result<Vec<EntityHead>, LedgerError> {
        let (table, pk) = table_of(edge.child);
        // edge.link is one of the static column names in the cascade table
        let sql = format!(
            "SELECT {pk} AS id, is_active, {} AS status FROM {table} WHERE {} = $1 FOR UPDATE",
            status_column(edge.child),
            edge.link
        );
        let rows = sqlx::query_as::<_, EntityHead>(&sql)
            .bind(parent_id)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn set_active(&mut self, kind: EntityKind, ids: &[Uuid], active: bool) -> Result<u64, LedgerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let (table, pk) = table_of(kind);
        let sql = format!(
            "UPDATE {table} SET is_active = $1, updated_at = now() WHERE {pk} = ANY($2) AND is_active <> $1"
        );
        let res = sqlx::query(&sql)
            .bind(active)
            .bind(ids.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(res.rows_affected())
    }

    async fn hard_delete(&mut self, kind: EntityKind, ids: &[Uuid]) -> Result<u64, LedgerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let (table, pk) = table_of(kind);
        let sql = format!("DELETE FROM {table} WHERE {pk} = ANY($1)");
        let res = sqlx::query(&sql)
            .bind(ids.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(res.rows_affected())
    }
}
