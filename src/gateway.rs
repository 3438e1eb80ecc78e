//! VNPay request signing and callback verification.
//!
//! Both directions sign the same way: parameters sorted by key, values
//! percent-encoded like a browser's `encodeURIComponent` with `%20` turned
//! into `+`, joined as `k=v&k=v`, then HMAC-SHA512 with the merchant secret.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use thiserror::Error;
use uuid::Uuid;

type HmacSha512 = Hmac<Sha512>;

const VERSION: &str = "2.1.0";
const CHECKOUT_TTL_MINUTES: i64 = 15;
// Asia/Ho_Chi_Minh, no DST
const GATEWAY_UTC_OFFSET_SECS: i32 = 7 * 3600;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("missing callback field {0}")]
    MissingField(&'static str),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("gateway is not configured: {0}")]
    NotConfigured(&'static str),
}

#[derive(Debug, Clone)]
pub struct VnPay {
    pub tmn_code: String,
    pub hash_secret: String,
    pub payment_url: String,
    pub return_url: String,
}

/// A callback whose signature checked out.
#[derive(Debug, Clone)]
pub struct VerifiedCallback {
    pub order_id: String,
    /// VND, already divided back from the gateway's x100 unit.
    pub amount: i64,
    pub response_code: String,
    pub transaction_status: String,
    pub transaction_no: Option<String>,
    pub bank_code: Option<String>,
    pub pay_date: Option<String>,
}

impl VnPay {
    fn mac(&self) -> Result<HmacSha512, GatewayError> {
        if self.hash_secret.is_empty() {
            return Err(GatewayError::NotConfigured("VNPAY_HASH_SECRET"));
        }
        HmacSha512::new_from_slice(self.hash_secret.as_bytes())
            .map_err(|_| GatewayError::NotConfigured("VNPAY_HASH_SECRET"))
    }

    /// Hex HMAC-SHA512 over the canonical form of `params`.
    pub fn sign(&self, params: &BTreeMap<String, String>) -> Result<String, GatewayError> {
        let mut mac = self.mac()?;
        mac.update(sign_data(params).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Checks `vnp_SecureHash` against the remaining parameters and extracts
    /// the fields reconciliation needs.
    pub fn verify(&self, query: &BTreeMap<String, String>) -> Result<VerifiedCallback, GatewayError> {
        let provided = query
            .get("vnp_SecureHash")
            .ok_or(GatewayError::MissingField("vnp_SecureHash"))?;
        let signed: BTreeMap<String, String> = query
            .iter()
            .filter(|(k, _)| k.as_str() != "vnp_SecureHash" && k.as_str() != "vnp_SecureHashType")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let expected = hex::decode(provided).map_err(|_| GatewayError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(sign_data(&signed).as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| GatewayError::InvalidSignature)?;

        let field = |name: &'static str| query.get(name).cloned().ok_or(GatewayError::MissingField(name));
        Ok(VerifiedCallback {
            order_id: field("vnp_TxnRef")?,
            amount: parse_amount(&field("vnp_Amount")?)?,
            response_code: field("vnp_ResponseCode")?,
            transaction_status: field("vnp_TransactionStatus")?,
            transaction_no: query.get("vnp_TransactionNo").cloned(),
            bank_code: query.get("vnp_BankCode").cloned(),
            pay_date: query.get("vnp_PayDate").cloned(),
        })
    }

    /// Signed checkout URL for paying `amount` VND against an invoice.
    pub fn checkout_url(
        &self,
        invoice_id: Uuid,
        amount: i64,
        bank_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, GatewayError> {
        if self.tmn_code.is_empty() {
            return Err(GatewayError::NotConfigured("VNPAY_TMN_CODE"));
        }
        let minor = amount
            .checked_mul(100)
            .filter(|m| *m > 0)
            .ok_or_else(|| GatewayError::InvalidAmount(amount.to_string()))?;

        let txn_ref = invoice_id.simple().to_string();
        let tz = FixedOffset::east_opt(GATEWAY_UTC_OFFSET_SECS)
            .ok_or(GatewayError::NotConfigured("gateway timezone"))?;
        let created = now.with_timezone(&tz);
        let expires = created + Duration::minutes(CHECKOUT_TTL_MINUTES);

        let mut params: BTreeMap<String, String> = [
            ("vnp_Version", VERSION.to_string()),
            ("vnp_Command", "pay".to_string()),
            ("vnp_TmnCode", self.tmn_code.clone()),
            ("vnp_Amount", minor.to_string()),
            ("vnp_CurrCode", "VND".to_string()),
            ("vnp_TxnRef", txn_ref.clone()),
            ("vnp_OrderInfo", format!("Thanh toan hoa don {txn_ref}")),
            ("vnp_OrderType", "other".to_string()),
            ("vnp_Locale", "vn".to_string()),
            ("vnp_ReturnUrl", self.return_url.clone()),
            ("vnp_IpAddr", "127.0.0.1".to_string()),
            ("vnp_CreateDate", created.format("%Y%m%d%H%M%S").to_string()),
            ("vnp_ExpireDate", expires.format("%Y%m%d%H%M%S").to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        if let Some(bank) = bank_code.filter(|b| !b.is_empty()) {
            params.insert("vnp_BankCode".into(), bank.to_string());
        }

        let hash = self.sign(&params)?;
        Ok(format!("{}?{}&vnp_SecureHash={hash}", self.payment_url, sign_data(&params)))
    }
}

fn encode_component(value: &str) -> String {
    urlencoding::encode(value)
        .replace("%20", "+")
        .replace("%21", "!")
        .replace("%27", "'")
        .replace("%28", "(")
        .replace("%29", ")")
        .replace("%2A", "*")
}

fn sign_data(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={}", encode_component(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// `vnp_Amount` is in hundredths of a dong and must divide evenly.
pub fn parse_amount(raw: &str) -> Result<i64, GatewayError> {
    let minor: i64 = raw
        .trim()
        .parse()
        .map_err(|_| GatewayError::InvalidAmount(raw.to_string()))?;
    if minor <= 0 || minor % 100 != 0 {
        return Err(GatewayError::InvalidAmount(raw.to_string()));
    }
    Ok(minor / 100)
}

/// Human-readable text for a gateway response code.
pub fn response_message(code: &str) -> &'static str {
    match code {
        "00" => "Transaction successful",
        "07" => "Amount debited; transaction flagged as suspicious",
        "09" => "Card or account is not registered for internet banking",
        "10" => "Card or account verification failed more than 3 times",
        "11" => "Payment window expired, please try again",
        "12" => "Card or account is locked",
        "13" => "Wrong one-time password",
        "24" => "Customer cancelled the transaction",
        "51" => "Insufficient balance",
        "65" => "Daily transaction limit exceeded",
        "75" => "Paying bank is under maintenance",
        "79" => "Wrong payment password too many times",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> VnPay {
        VnPay {
            tmn_code: "DEMO0001".into(),
            hash_secret: "SECRETKEYFORTESTS".into(),
            payment_url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".into(),
            return_url: "http://localhost:8080/api/v1/payments/vnpay-return".into(),
        }
    }

    fn callback(gw: &VnPay, amount_minor: &str) -> BTreeMap<String, String> {
        let mut q: BTreeMap<String, String> = [
            ("vnp_TxnRef", "0b5d7a5c8f2e4d0c9a7e1f3b2c4d6e8f"),
            ("vnp_Amount", amount_minor),
            ("vnp_ResponseCode", "00"),
            ("vnp_TransactionStatus", "00"),
            ("vnp_TransactionNo", "14012345"),
            ("vnp_OrderInfo", "Thanh toan hoa don (lan 1)"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let hash = gw.sign(&q).unwrap();
        q.insert("vnp_SecureHashType".into(), "HmacSHA512".into());
        q.insert("vnp_SecureHash".into(), hash);
        q
    }

    #[test]
    fn encodes_like_a_browser_component() {
        assert_eq!(encode_component("Thanh toan (lan 1)!"), "Thanh+toan+(lan+1)!");
        assert_eq!(encode_component("a&b=c/d"), "a%26b%3Dc%2Fd");
    }

    #[test]
    fn accepts_a_correctly_signed_callback() {
        let gw = gateway();
        let verified = gw.verify(&callback(&gw, "30000000")).unwrap();
        assert_eq!(verified.amount, 300_000);
        assert_eq!(verified.response_code, "00");
        assert_eq!(verified.transaction_no.as_deref(), Some("14012345"));
    }

    #[test]
    fn rejects_tampered_fields() {
        let gw = gateway();
        let mut q = callback(&gw, "30000000");
        q.insert("vnp_Amount".into(), "90000000".into());
        assert!(matches!(gw.verify(&q), Err(GatewayError::InvalidSignature)));

        let mut q = callback(&gw, "30000000");
        q.insert("vnp_SecureHash".into(), "not-hex".into());
        assert!(matches!(gw.verify(&q), Err(GatewayError::InvalidSignature)));

        let other = VnPay {
            hash_secret: "another".into(),
            ..gateway()
        };
        assert!(matches!(other.verify(&callback(&gw, "100")), Err(GatewayError::InvalidSignature)));
    }

    #[test]
    fn amount_must_be_whole_dong() {
        assert_eq!(parse_amount("50000000").unwrap(), 500_000);
        assert!(parse_amount("12345").is_err());
        assert!(parse_amount("0").is_err());
        assert!(parse_amount("abc").is_err());

        let gw = gateway();
        assert!(matches!(
            gw.verify(&callback(&gw, "150")),
            Err(GatewayError::InvalidAmount(_))
        ));
    }

    #[test]
    fn checkout_url_is_verifiable() {
        let gw = gateway();
        let invoice = Uuid::new_v4();
        let url = gw.checkout_url(invoice, 250_000, Some("NCB"), Utc::now()).unwrap();
        let (base, query) = url.split_once('?').unwrap();
        assert_eq!(base, gw.payment_url);

        let params: BTreeMap<String, String> = query
            .split('&')
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| {
                let v = urlencoding::decode(&v.replace('+', " ")).unwrap().into_owned();
                (k.to_string(), v)
            })
            .collect();
        assert_eq!(params["vnp_Amount"], "25000000");
        assert_eq!(params["vnp_TxnRef"], invoice.simple().to_string());
        assert_eq!(params["vnp_BankCode"], "NCB");

        let mut signed = params.clone();
        signed.remove("vnp_SecureHash");
        assert_eq!(gw.sign(&signed).unwrap(), params["vnp_SecureHash"]);
    }

    #[test]
    fn unconfigured_gateway_refuses_checkout() {
        let gw = VnPay {
            tmn_code: String::new(),
            ..gateway()
        };
        assert!(matches!(
            gw.checkout_url(Uuid::new_v4(), 1_000, None, Utc::now()),
            Err(GatewayError::NotConfigured(_))
        ));
    }
}
