//! Invoices and payments.
//!
//! An invoice's status is never set directly: after every payment mutation it
//! is recomputed from the active payments inside the same transaction. The sum
//! of active payments never exceeds the invoice total.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::{GatewayError, VnPay};
use crate::inventory::{self, DeductionResult};
use crate::ledger::{LedgerError, LedgerStore, LedgerTx};
use crate::models::{Invoice, InvoiceStatus, NewInvoice, NewPayment, Payment, PaymentMethod, Role};
use crate::notify::{self, Notification, NotificationSink, Recipient};

#[derive(Debug, Clone, Serialize)]
pub struct InvoiceBalance {
    pub invoice_id: Uuid,
    pub total_amount: i64,
    pub paid: i64,
    pub remaining: i64,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct FulfilledInvoice {
    pub invoice: Invoice,
    pub deductions: Vec<DeductionResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub invoice_status: InvoiceStatus,
    pub paid: i64,
    pub remaining: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRequest {
    pub invoice_id: Uuid,
    pub amount: i64,
    pub method: PaymentMethod,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackChannel {
    Return,
    Ipn,
}

#[derive(Debug, Clone)]
pub struct GatewayCallback {
    pub order_id: String,
    pub amount: i64,
    pub response_code: String,
    pub transaction_status: String,
    pub channel: CallbackChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Applied,
    Duplicate,
    Declined,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackResult {
    pub invoice_id: Uuid,
    pub outcome: CallbackOutcome,
    pub status: InvoiceStatus,
    pub payment: Option<Payment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutLink {
    pub invoice_id: Uuid,
    pub amount: i64,
    pub payment_url: String,
}

fn paid_total(payments: &[Payment]) -> i64 {
    payments.iter().map(|p| p.amount).sum()
}

/// Invoice locked for the rest of the transaction; missing and inactive
/// invoices are both reported as not found.
async fn active_invoice(tx: &mut dyn LedgerTx, invoice_id: Uuid) -> Result<Invoice, LedgerError> {
    tx.lock_invoice(invoice_id)
        .await?
        .filter(|i| i.is_active)
        .ok_or_else(|| LedgerError::not_found(format!("invoice {invoice_id} not found")))
}

/// Recomputes and persists the status from the active payments.
pub(crate) async fn settle(tx: &mut dyn LedgerTx, invoice: &Invoice) -> Result<(i64, InvoiceStatus), LedgerError> {
    let paid = paid_total(&tx.active_payments(invoice.invoice_id).await?);
    let status = InvoiceStatus::from_amounts(paid, invoice.total_amount);
    tx.set_invoice_status(invoice.invoice_id, status).await?;
    Ok((paid, status))
}

fn check_amount(amount: i64) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::validation("amount must be greater than 0"));
    }
    Ok(())
}

fn check_room(amount: i64, remaining: i64) -> Result<(), LedgerError> {
    if amount > remaining {
        return Err(LedgerError::Overpayment { amount, remaining });
    }
    Ok(())
}

async fn ensure_single_gateway(
    tx: &mut dyn LedgerTx,
    invoice_id: Uuid,
    except: Option<Uuid>,
) -> Result<(), LedgerError> {
    let clash = tx
        .active_payments(invoice_id)
        .await?
        .iter()
        .any(|p| p.method.is_gateway() && Some(p.payment_id) != except);
    if clash {
        return Err(LedgerError::validation("invoice already has an active VNPay payment"));
    }
    Ok(())
}

/// `1234567` -> `1.234.567 ₫`
pub fn format_vnd(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 4);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(ch);
    }
    if amount < 0 {
        out.insert(0, '-');
    }
    out.push_str(" ₫");
    out
}

#[derive(Clone)]
pub struct BillingEngine {
    ledger: Arc<dyn LedgerStore>,
    sink: Arc<dyn NotificationSink>,
}

impl BillingEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { ledger, sink }
    }

    /// Prices the record's prescriptions, deducts stock FEFO and creates an
    /// unpaid invoice, all in one transaction. Stock shortfalls do not block
    /// the invoice; they are returned with the deductions.
    pub async fn create_invoice_from_record(&self, record_id: Uuid) -> Result<FulfilledInvoice, LedgerError> {
        let now = Utc::now();
        let mut tx = self.ledger.begin().await?;

        let record = tx
            .medical_record(record_id)
            .await?
            .filter(|r| r.is_active)
            .ok_or_else(|| LedgerError::not_found(format!("medical record {record_id} not found")))?;
        let appointment_id = record
            .appointment_id
            .ok_or_else(|| LedgerError::validation("medical record is not linked to an appointment"))?;
        if record.prescriptions.is_empty() {
            return Err(LedgerError::validation("medical record has no prescriptions"));
        }

        let mut total: i64 = 0;
        for line in &record.prescriptions {
            if line.quantity <= 0 {
                return Err(LedgerError::validation("prescribed quantity must be greater than 0"));
            }
            let medicine = tx
                .medicine(line.medicine_id)
                .await?
                .filter(|m| m.is_active)
                .ok_or_else(|| LedgerError::not_found(format!("medicine {} not found", line.medicine_id)))?;
            total = medicine
                .price
                .checked_mul(i64::from(line.quantity))
                .and_then(|line_total| total.checked_add(line_total))
                .ok_or_else(|| LedgerError::validation("invoice total overflow"))?;
        }
        if total <= 0 {
            return Err(LedgerError::validation("invoice total must be greater than 0"));
        }

        if let Some(existing) = tx.active_invoice_for_appointment(appointment_id).await? {
            return Err(LedgerError::validation(format!(
                "an invoice already exists for this appointment: {}",
                existing.invoice_id
            )));
        }

        let deductions = inventory::fulfil_prescriptions(tx.as_mut(), &record.prescriptions, now).await?;
        let invoice = tx
            .insert_invoice(&NewInvoice {
                patient_id: record.patient_id,
                appointment_id,
                total_amount: total,
            })
            .await?;
        tx.commit().await?;

        let short: i32 = deductions.iter().map(|d| d.shortfall).sum();
        tracing::info!(
            invoice_id = %invoice.invoice_id,
            %record_id,
            total,
            shortfall = short,
            "invoice created from medical record"
        );

        for role in [Role::Accountant, Role::Admin] {
            notify::emit(
                self.sink.as_ref(),
                Notification::to_role(
                    role,
                    "invoice_created",
                    "New invoice",
                    format!("Invoice for patient {} totalling {}", invoice.patient_id, format_vnd(total)),
                )
                .related("invoice", invoice.invoice_id),
            );
        }
        if short > 0 {
            notify::emit(
                self.sink.as_ref(),
                Notification::to_role(
                    Role::Pharmacist,
                    "stock_shortfall",
                    "Insufficient stock",
                    format!("{short} unit(s) could not be dispensed for invoice {}", invoice.invoice_id),
                )
                .related("invoice", invoice.invoice_id),
            );
        }

        Ok(FulfilledInvoice { invoice, deductions })
    }

    pub async fn invoice_balance(&self, invoice_id: Uuid) -> Result<InvoiceBalance, LedgerError> {
        let mut tx = self.ledger.begin().await?;
        let invoice = active_invoice(tx.as_mut(), invoice_id).await?;
        let paid = paid_total(&tx.active_payments(invoice_id).await?);
        Ok(InvoiceBalance {
            invoice_id,
            total_amount: invoice.total_amount,
            paid,
            remaining: (invoice.total_amount - paid).max(0),
            status: InvoiceStatus::from_amounts(paid, invoice.total_amount),
        })
    }

    pub async fn create_payment(&self, req: PaymentRequest) -> Result<PaymentReceipt, LedgerError> {
        check_amount(req.amount)?;
        let mut tx = self.ledger.begin().await?;
        let invoice = active_invoice(tx.as_mut(), req.invoice_id).await?;
        if req.method.is_gateway() {
            ensure_single_gateway(tx.as_mut(), invoice.invoice_id, None).await?;
        }
        let paid = paid_total(&tx.active_payments(invoice.invoice_id).await?);
        check_room(req.amount, invoice.total_amount - paid)?;

        let payment = tx
            .insert_payment(&NewPayment {
                invoice_id: invoice.invoice_id,
                method: req.method,
                amount: req.amount,
                paid_at: req.paid_at.unwrap_or_else(Utc::now),
            })
            .await?;
        let login = tx.patient_login(invoice.patient_id).await?;
        let receipt = self.finish(tx, &invoice, payment).await?;
        self.announce_payment(&invoice, &receipt, login);
        Ok(receipt)
    }

    pub async fn update_payment(&self, payment_id: Uuid, amount: i64) -> Result<PaymentReceipt, LedgerError> {
        check_amount(amount)?;
        let mut tx = self.ledger.begin().await?;
        let payment = tx
            .payment(payment_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| LedgerError::not_found(format!("payment {payment_id} not found")))?;
        let invoice = active_invoice(tx.as_mut(), payment.invoice_id).await?;

        let others: i64 = tx
            .active_payments(invoice.invoice_id)
            .await?
            .iter()
            .filter(|p| p.payment_id != payment_id)
            .map(|p| p.amount)
            .sum();
        check_room(amount, invoice.total_amount - others)?;

        tx.set_payment_amount(payment_id, amount).await?;
        let receipt = self.finish(tx, &invoice, Payment { amount, ..payment }).await?;
        tracing::info!(%payment_id, amount, status = ?receipt.invoice_status, "payment updated");
        Ok(receipt)
    }

    pub async fn remove_payment(&self, payment_id: Uuid) -> Result<PaymentReceipt, LedgerError> {
        let mut tx = self.ledger.begin().await?;
        let payment = tx
            .payment(payment_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| LedgerError::not_found(format!("payment {payment_id} not found")))?;
        let invoice = tx
            .lock_invoice(payment.invoice_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("invoice {} not found", payment.invoice_id)))?;

        tx.set_payment_active(payment_id, false).await?;
        let receipt = self
            .finish(tx, &invoice, Payment { is_active: false, ..payment })
            .await?;
        tracing::info!(%payment_id, status = ?receipt.invoice_status, "payment removed");
        Ok(receipt)
    }

    pub async fn restore_payment(&self, payment_id: Uuid) -> Result<PaymentReceipt, LedgerError> {
        let mut tx = self.ledger.begin().await?;
        let payment = tx
            .payment(payment_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("payment {payment_id} not found")))?;
        let invoice = active_invoice(tx.as_mut(), payment.invoice_id).await?;

        if payment.is_active {
            let (paid, status) = settle(tx.as_mut(), &invoice).await?;
            return Ok(PaymentReceipt {
                payment,
                invoice_status: status,
                paid,
                remaining: invoice.total_amount - paid,
            });
        }

        if payment.method.is_gateway() {
            ensure_single_gateway(tx.as_mut(), invoice.invoice_id, Some(payment_id)).await?;
        }
        let paid = paid_total(&tx.active_payments(invoice.invoice_id).await?);
        check_room(payment.amount, invoice.total_amount - paid)?;

        tx.set_payment_active(payment_id, true).await?;
        let receipt = self
            .finish(tx, &invoice, Payment { is_active: true, ..payment })
            .await?;
        tracing::info!(%payment_id, status = ?receipt.invoice_status, "payment restored");
        Ok(receipt)
    }

    /// Applies a verified gateway callback. Redelivery and the return/IPN
    /// pair are absorbed: at most one active gateway payment per invoice.
    pub async fn reconcile_gateway_callback(&self, cb: GatewayCallback) -> Result<CallbackResult, LedgerError> {
        let invoice_id = Uuid::parse_str(cb.order_id.trim())
            .map_err(|_| LedgerError::validation(format!("malformed order id {:?}", cb.order_id)))?;

        let mut tx = self.ledger.begin().await?;
        let invoice = active_invoice(tx.as_mut(), invoice_id).await?;

        if cb.response_code != "00" || cb.transaction_status != "00" {
            tracing::info!(
                %invoice_id,
                channel = ?cb.channel,
                response_code = %cb.response_code,
                "gateway reported an unsuccessful payment"
            );
            return Ok(CallbackResult {
                invoice_id,
                outcome: CallbackOutcome::Declined,
                status: invoice.status,
                payment: None,
            });
        }

        let active = tx.active_payments(invoice_id).await?;
        if let Some(existing) = active.iter().find(|p| p.method.is_gateway()) {
            tracing::debug!(%invoice_id, channel = ?cb.channel, "gateway payment already recorded");
            return Ok(CallbackResult {
                invoice_id,
                outcome: CallbackOutcome::Duplicate,
                status: invoice.status,
                payment: Some(existing.clone()),
            });
        }

        check_amount(cb.amount)?;
        check_room(cb.amount, invoice.total_amount - paid_total(&active))?;

        let payment = tx
            .insert_payment(&NewPayment {
                invoice_id,
                method: PaymentMethod::VnPay,
                amount: cb.amount,
                paid_at: Utc::now(),
            })
            .await?;
        let login = tx.patient_login(invoice_id).await?;
        let receipt = self.finish(tx, &invoice, payment).await?;
        tracing::info!(
            %invoice_id,
            channel = ?cb.channel,
            amount = cb.amount,
            status = ?receipt.invoice_status,
            "gateway payment applied"
        );
        self.announce_payment(&invoice, &receipt, login);

        Ok(CallbackResult {
            invoice_id,
            outcome: CallbackOutcome::Applied,
            status: receipt.invoice_status,
            payment: Some(receipt.payment),
        })
    }

    /// Signed gateway link for the invoice's outstanding balance.
    pub async fn checkout_link(
        &self,
        vnpay: &VnPay,
        invoice_id: Uuid,
        bank_code: Option<&str>,
    ) -> Result<CheckoutLink, LedgerError> {
        let balance = self.invoice_balance(invoice_id).await?;
        if balance.remaining <= 0 {
            return Err(LedgerError::validation("invoice is already fully paid"));
        }
        let payment_url = vnpay
            .checkout_url(invoice_id, balance.remaining, bank_code, Utc::now())
            .map_err(|e: GatewayError| LedgerError::Store(e.to_string()))?;
        Ok(CheckoutLink {
            invoice_id,
            amount: balance.remaining,
            payment_url,
        })
    }

    async fn finish(
        &self,
        mut tx: Box<dyn LedgerTx>,
        invoice: &Invoice,
        payment: Payment,
    ) -> Result<PaymentReceipt, LedgerError> {
        let (paid, status) = settle(tx.as_mut(), invoice).await?;
        tx.commit().await?;
        Ok(PaymentReceipt {
            payment,
            invoice_status: status,
            paid,
            remaining: invoice.total_amount - paid,
        })
    }

    /// `login` is the patient's user account; patients without one only
    /// show up in the accountant feed.
    fn announce_payment(&self, invoice: &Invoice, receipt: &PaymentReceipt, login: Option<Uuid>) {
        let message = format!(
            "{} received for invoice {}",
            format_vnd(receipt.payment.amount),
            invoice.invoice_id
        );
        notify::emit(
            self.sink.as_ref(),
            Notification::to_role(Role::Accountant, "payment_created", "Payment received", message.clone())
                .related("payment", receipt.payment.payment_id),
        );
        let Some(user_id) = login else {
            tracing::debug!(patient_id = %invoice.patient_id, "patient has no login, payment notice not sent");
            return;
        };
        let mut to_patient = Notification::to_role(Role::Patient, "payment_created", "Payment received", message)
            .related("invoice", invoice.invoice_id);
        to_patient.recipient = Recipient::User(user_id);
        notify::emit(self.sink.as_ref(), to_patient);
    }
}
