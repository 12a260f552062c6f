//! Server configuration, entirely from the environment (optionally seeded
//! by a `.env` file).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use rust_decimal::Decimal;
use sokoni_common::money::Currency;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4000";
const DEFAULT_FEE_RATE: &str = "0.02";
const DEFAULT_AUTO_RELEASE_DAYS: i64 = 7;
const DEFAULT_SCHEDULER_INTERVAL_SECS: u64 = 30 * 60;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    /// Provider secret: authenticates outbound calls and verifies inbound
    /// webhook signatures.
    pub provider_secret_key: String,
    /// Override for tests / sandboxes; the client's default otherwise.
    pub provider_base_url: Option<String>,
    pub fee_rate: Decimal,
    pub currency: Currency,
    pub auto_release_days: i64,
    pub scheduler_interval: Duration,
    /// Where the provider redirects the buyer after checkout.
    pub frontend_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = var_or("BIND_ADDR", DEFAULT_BIND_ADDR);
        let bind_addr = SocketAddr::from_str(&bind_addr)
            .with_context(|| format!("bad BIND_ADDR: {bind_addr}"))?;

        let provider_secret_key = std::env::var("PROVIDER_SECRET_KEY")
            .context("PROVIDER_SECRET_KEY is required")?;
        if provider_secret_key.trim().is_empty() {
            bail!("PROVIDER_SECRET_KEY must not be empty");
        }

        let fee_rate = var_or("FEE_RATE", DEFAULT_FEE_RATE);
        let fee_rate = Decimal::from_str(&fee_rate)
            .with_context(|| format!("bad FEE_RATE: {fee_rate}"))?;
        if fee_rate.is_sign_negative() || fee_rate >= Decimal::ONE {
            bail!("FEE_RATE must be within [0, 1)");
        }

        let currency = var_or("CURRENCY", Currency::KES);
        let currency = Currency::new(&currency)
            .map_err(|_| anyhow::anyhow!("bad CURRENCY: {currency}"))?;

        let auto_release_days = parse_var(
            "AUTO_RELEASE_DAYS",
            DEFAULT_AUTO_RELEASE_DAYS,
        )?;
        if auto_release_days <= 0 {
            bail!("AUTO_RELEASE_DAYS must be positive");
        }

        let interval_secs: u64 = parse_var(
            "SCHEDULER_INTERVAL_SECS",
            DEFAULT_SCHEDULER_INTERVAL_SECS,
        )?;

        Ok(Self {
            bind_addr,
            database_url: database_url()?,
            provider_secret_key,
            provider_base_url: std::env::var("PROVIDER_BASE_URL").ok(),
            fee_rate,
            currency,
            auto_release_days,
            scheduler_interval: Duration::from_secs(interval_secs),
            frontend_url: std::env::var("FRONTEND_URL").ok(),
        })
    }
}

/// `DATABASE_URL` wins; otherwise compose one from the `DB_*` parts.
fn database_url() -> anyhow::Result<String> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return Ok(url);
    }
    let user = std::env::var("DB_USER")
        .context("either DATABASE_URL or DB_USER is required")?;
    let password = std::env::var("DB_PASSWORD").unwrap_or_default();
    let host = var_or("DB_HOST", "localhost");
    let port = var_or("DB_PORT", "5432");
    let name = var_or("DB_NAME", "sokoni");
    Ok(format!("postgres://{user}:{password}@{host}:{port}/{name}"))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("could not parse {name}: {raw}")),
        Err(_) => Ok(default),
    }
}
