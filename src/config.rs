use std::env;
use std::str::FromStr;

use anyhow::{Context, bail};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub bind_addr: String,
    pub vnpay_tmn_code: String,
    pub vnpay_hash_secret: String,
    pub vnpay_payment_url: String,
    pub vnpay_return_url: String,
    pub frontend_url: String,
    pub notify_capacity: usize,
    pub conflict_retries: u32,
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{key} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let store = match env::var("LEDGER_STORE").as_deref() {
            Ok("memory") => StoreKind::Memory,
            Ok("postgres") | Err(_) => StoreKind::Postgres,
            Ok(other) => bail!("LEDGER_STORE must be postgres or memory, got {other:?}"),
        };

        let database_url = env::var("DATABASE_URL").ok();
        if store == StoreKind::Postgres && database_url.is_none() {
            bail!("DATABASE_URL is required when LEDGER_STORE=postgres");
        }

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let vnpay_hash_secret = env::var("VNPAY_HASH_SECRET").context("VNPAY_HASH_SECRET is required")?;

        Ok(Self {
            store,
            database_url,
            db_max_connections: parsed_or("DB_MAX_CONNECTIONS", 10)?,
            vnpay_return_url: env::var("VNPAY_RETURN_URL")
                .unwrap_or_else(|_| format!("http://{bind_addr}/api/v1/payments/vnpay-return")),
            bind_addr,
            vnpay_tmn_code: env::var("VNPAY_TMN_CODE").unwrap_or_default(),
            vnpay_hash_secret,
            vnpay_payment_url: env::var("VNPAY_PAYMENT_URL")
                .unwrap_or_else(|_| "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string()),
            frontend_url: env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string()),
            notify_capacity: parsed_or("NOTIFY_CAPACITY", 256)?,
            conflict_retries: parsed_or("CONFLICT_RETRIES", 3)?,
        })
    }
}
