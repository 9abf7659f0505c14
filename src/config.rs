use chrono::Weekday;
use config::{Config, Environment};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::{collections::HashMap, str::FromStr, time::Duration};

use crate::{
    billing::stripe::{StripeConfig, DEFAULT_API_BASE},
    error::{AppError, AppResult},
    ledger::models::SubscriptionTier,
    settlement::{
        calculator::{ProfitShareConfig, TierPolicy},
        scheduler::SettlementScheduleConfig,
    },
};

/// Flat view of the environment; keys are the lowercased variable names
#[derive(Debug, Deserialize)]
struct RawSettings {
    database_url: Option<String>,
    bind_address: String,
    settlement_day_of_week: u32,
    settlement_hour_utc: u32,
    settlement_snapshot_interval_hours: u64,
    settlement_tick_secs: u64,
    settlement_minimum_payout: String,
    settlement_call_timeout_secs: u64,
    settlement_concurrency: usize,
    settlement_rate_free: String,
    settlement_rate_trader: String,
    settlement_rate_pro: String,
    settlement_rate_whale: String,
    settlement_min_payout_free: Option<String>,
    settlement_min_payout_trader: Option<String>,
    settlement_min_payout_pro: Option<String>,
    settlement_min_payout_whale: Option<String>,
    stripe_secret_key: Option<String>,
    stripe_webhook_secret: Option<String>,
    stripe_publishable_key: Option<String>,
    stripe_api_base: String,
    stripe_webhook_tolerance_secs: u64,
    stripe_price_trader: Option<String>,
    stripe_price_pro: Option<String>,
    stripe_price_whale: Option<String>,
}

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_address: String,
    pub schedule: SettlementScheduleConfig,
    pub profit_share: ProfitShareConfig,
    pub stripe: StripeConfig,
    /// Bound on every ledger, store and gateway call
    pub call_timeout: Duration,
    /// Accounts settled in parallel within one pass
    pub concurrency: usize,
}

impl Settings {
    pub fn from_env() -> AppResult<Self> {
        Self::load(Environment::default())
    }

    fn load(environment: Environment) -> AppResult<Self> {
        let raw: RawSettings = Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("settlement_day_of_week", 0)?
            .set_default("settlement_hour_utc", 0)?
            .set_default("settlement_snapshot_interval_hours", 4)?
            .set_default("settlement_tick_secs", 60)?
            .set_default("settlement_minimum_payout", "10")?
            .set_default("settlement_call_timeout_secs", 30)?
            .set_default("settlement_concurrency", 1)?
            .set_default("settlement_rate_free", "0.30")?
            .set_default("settlement_rate_trader", "0.20")?
            .set_default("settlement_rate_pro", "0.12")?
            .set_default("settlement_rate_whale", "0.05")?
            .set_default("stripe_api_base", DEFAULT_API_BASE)?
            .set_default("stripe_webhook_tolerance_secs", 300)?
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> AppResult<Self> {
        let database_url = non_empty(raw.database_url)
            .ok_or_else(|| AppError::Config("DATABASE_URL must be set".to_string()))?;

        let settlement_weekday = weekday_from_index(raw.settlement_day_of_week).ok_or_else(|| {
            AppError::Config(format!(
                "SETTLEMENT_DAY_OF_WEEK must be 0-6 (0 = Sunday), got {}",
                raw.settlement_day_of_week
            ))
        })?;
        if raw.settlement_hour_utc > 23 {
            return Err(AppError::Config(format!(
                "SETTLEMENT_HOUR_UTC must be 0-23, got {}",
                raw.settlement_hour_utc
            )));
        }
        if raw.settlement_snapshot_interval_hours == 0
            || raw.settlement_tick_secs == 0
            || raw.settlement_call_timeout_secs == 0
        {
            return Err(AppError::Config("Intervals and timeouts must be greater than zero".to_string()));
        }
        if raw.settlement_concurrency == 0 {
            return Err(AppError::Config("SETTLEMENT_CONCURRENCY must be at least 1".to_string()));
        }

        let minimum_payout = parse_amount("SETTLEMENT_MINIMUM_PAYOUT", &raw.settlement_minimum_payout)?;

        let mut tiers = HashMap::new();
        for (tier, rate, min_payout, rate_key, min_key) in [
            (SubscriptionTier::Free, &raw.settlement_rate_free, &raw.settlement_min_payout_free, "SETTLEMENT_RATE_FREE", "SETTLEMENT_MIN_PAYOUT_FREE"),
            (SubscriptionTier::Trader, &raw.settlement_rate_trader, &raw.settlement_min_payout_trader, "SETTLEMENT_RATE_TRADER", "SETTLEMENT_MIN_PAYOUT_TRADER"),
            (SubscriptionTier::Pro, &raw.settlement_rate_pro, &raw.settlement_min_payout_pro, "SETTLEMENT_RATE_PRO", "SETTLEMENT_MIN_PAYOUT_PRO"),
            (SubscriptionTier::Whale, &raw.settlement_rate_whale, &raw.settlement_min_payout_whale, "SETTLEMENT_RATE_WHALE", "SETTLEMENT_MIN_PAYOUT_WHALE"),
        ] {
            let rate = parse_rate(rate_key, rate)?;
            let minimum_payout = match non_empty(min_payout.clone()) {
                Some(value) => Some(parse_amount(min_key, &value)?),
                None => None,
            };
            tiers.insert(tier, TierPolicy { rate, minimum_payout });
        }

        let mut prices = HashMap::new();
        for (tier, price) in [
            (SubscriptionTier::Trader, raw.stripe_price_trader),
            (SubscriptionTier::Pro, raw.stripe_price_pro),
            (SubscriptionTier::Whale, raw.stripe_price_whale),
        ] {
            if let Some(price) = non_empty(price) {
                prices.insert(tier, price);
            }
        }

        Ok(Self {
            database_url,
            bind_address: raw.bind_address,
            schedule: SettlementScheduleConfig {
                settlement_weekday,
                settlement_hour: raw.settlement_hour_utc,
                snapshot_interval: Duration::from_secs(raw.settlement_snapshot_interval_hours * 3600),
                tick_interval: Duration::from_secs(raw.settlement_tick_secs),
            },
            profit_share: ProfitShareConfig { tiers, minimum_payout },
            stripe: StripeConfig {
                secret_key: non_empty(raw.stripe_secret_key),
                webhook_secret: non_empty(raw.stripe_webhook_secret),
                publishable_key: non_empty(raw.stripe_publishable_key),
                api_base: raw.stripe_api_base.trim_end_matches('/').to_string(),
                webhook_tolerance_secs: raw.stripe_webhook_tolerance_secs,
                prices,
            },
            call_timeout: Duration::from_secs(raw.settlement_call_timeout_secs),
            concurrency: raw.settlement_concurrency,
        })
    }
}

/// 0 = Sunday ... 6 = Saturday
pub fn weekday_from_index(index: u32) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_amount(key: &str, value: &str) -> AppResult<Decimal> {
    let amount = Decimal::from_str(value.trim())
        .map_err(|e| AppError::Config(format!("{} is not a decimal ({}): {}", key, value, e)))?;
    if amount < Decimal::ZERO {
        return Err(AppError::Config(format!("{} must not be negative", key)));
    }
    Ok(amount)
}

fn parse_rate(key: &str, value: &str) -> AppResult<Decimal> {
    let rate = parse_amount(key, value)?;
    if rate > Decimal::ONE {
        return Err(AppError::Config(format!("{} must be between 0 and 1, got {}", key, rate)));
    }
    Ok(rate)
}
