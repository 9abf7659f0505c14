// Settlement Scheduler - weekly profit-share settlement
//
// Two loops, started and stopped together:
// - settlement loop: polls on a short tick, fires once the weekly boundary
//   (configured weekday + hour, UTC) has passed, then moves to the next week
// - snapshot loop: captures balance snapshots immediately, then every interval
//
// Stop signals both loops and joins them. A running pass starts no new account
// once signalled; accounts already in flight finish.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::{AppResult, SettlementError},
    settlement::service::{AccountSettlement, BatchSummary, RetrySummary, SettlementService, SETTLEMENT_WINDOW_DAYS},
};

/// Settlement schedule configuration
#[derive(Debug, Clone)]
pub struct SettlementScheduleConfig {
    /// Day of the weekly boundary (UTC)
    pub settlement_weekday: Weekday,
    /// UTC hour of the weekly boundary (0-23)
    pub settlement_hour: u32,
    pub snapshot_interval: Duration,
    /// Poll period of the settlement loop
    pub tick_interval: Duration,
}

impl Default for SettlementScheduleConfig {
    fn default() -> Self {
        Self {
            settlement_weekday: Weekday::Sun,
            settlement_hour: 0,
            snapshot_interval: Duration::from_secs(4 * 3600),
            tick_interval: Duration::from_secs(60),
        }
    }
}

/// Operator view of the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub settlement_day: String,
    pub settlement_hour: u32,
    pub minimum_payout: Decimal,
}

#[derive(Default)]
struct SchedulerState {
    running: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    shutdown: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

/// Settlement scheduler - owns the background loops and their shutdown
pub struct SettlementScheduler {
    config: SettlementScheduleConfig,
    service: Arc<SettlementService>,
    state: Arc<Mutex<SchedulerState>>,
}

impl SettlementScheduler {
    pub fn new(config: SettlementScheduleConfig, service: Arc<SettlementService>) -> Self {
        Self {
            config,
            service,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    /// Start both loops; rejected if already running
    pub fn start(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.running {
            return Err(SettlementError::AlreadyRunning.into());
        }

        let next_run = next_settlement_after(
            Utc::now(),
            self.config.settlement_weekday,
            self.config.settlement_hour,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let settlement = tokio::spawn(Self::run_settlement_loop(
            self.config.clone(),
            self.service.clone(),
            self.state.clone(),
            shutdown_rx.clone(),
        ));
        let snapshots = tokio::spawn(Self::run_snapshot_loop(
            self.config.snapshot_interval,
            self.service.clone(),
            shutdown_rx,
        ));

        state.running = true;
        state.next_run = Some(next_run);
        state.shutdown = Some(shutdown_tx);
        state.handles = vec![settlement, snapshots];

        info!(
            "⏰ Settlement scheduler started, next settlement at {} UTC",
            next_run.format("%Y-%m-%d %H:%M:%S")
        );
        Ok(())
    }

    /// Signal both loops and wait for them to exit
    pub async fn stop(&self) {
        let (shutdown, handles) = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            (state.shutdown.take(), std::mem::take(&mut state.handles))
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("❌ Scheduler loop ended abnormally: {:?}", e);
            }
        }

        info!("🛑 Settlement scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.lock();
        SchedulerStatus {
            running: state.running,
            last_run: state.last_run,
            next_run: state.next_run,
            settlement_day: self.config.settlement_weekday.to_string(),
            settlement_hour: self.config.settlement_hour,
            minimum_payout: self.service.minimum_payout(),
        }
    }

    /// Operator-triggered pass over the most recently closed window
    pub async fn run_now(&self) -> AppResult<BatchSummary> {
        let window_end = self.current_window_end();
        let summary = self.service.run_weekly_settlement(window_end).await?;
        self.state.lock().last_run = Some(Utc::now());
        Ok(summary)
    }

    /// Settle one account for the most recently closed window
    pub async fn manual_settlement(&self, account_id: Uuid) -> AppResult<AccountSettlement> {
        self.service
            .manual_settlement(account_id, self.current_window_end())
            .await
    }

    pub async fn retry_failed_invoices(&self) -> AppResult<RetrySummary> {
        self.service.retry_failed_invoices().await
    }

    fn current_window_end(&self) -> DateTime<Utc> {
        previous_boundary(
            Utc::now(),
            self.config.settlement_weekday,
            self.config.settlement_hour,
        )
    }

    async fn run_settlement_loop(
        config: SettlementScheduleConfig,
        service: Arc<SettlementService>,
        state: Arc<Mutex<SchedulerState>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            let next_run = state.lock().next_run;
            let Some(fire_at) = next_run else {
                continue;
            };
            if now < fire_at {
                continue;
            }

            info!("🔄 Starting weekly settlement cycle");
            match service.run_weekly_settlement_until(fire_at, shutdown.clone()).await {
                Ok(summary) => info!(
                    "✓ Settlement cycle completed: {} succeeded, {} failed, {} skipped",
                    summary.succeeded, summary.failed, summary.skipped
                ),
                Err(e) => error!("❌ Weekly settlement pass failed: {}", e),
            }
            if *shutdown.borrow() {
                break;
            }

            // Never fire twice for the same window
            let next = next_settlement_after(Utc::now(), config.settlement_weekday, config.settlement_hour)
                .max(fire_at + ChronoDuration::days(SETTLEMENT_WINDOW_DAYS));
            {
                let mut state = state.lock();
                state.last_run = Some(now);
                state.next_run = Some(next);
            }
            info!("⏰ Next settlement scheduled for: {} UTC", next.format("%Y-%m-%d %H:%M:%S"));
        }
    }

    async fn run_snapshot_loop(
        snapshot_interval: Duration,
        service: Arc<SettlementService>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // First tick completes immediately
        let mut ticker = interval(snapshot_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = service.take_all_balance_snapshots().await {
                warn!("Balance snapshot pass failed: {}", e);
            }
        }
    }
}

/// First weekly boundary strictly after `now`
pub fn next_settlement_after(now: DateTime<Utc>, weekday: Weekday, hour: u32) -> DateTime<Utc> {
    let at_hour = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(at_hour));

    let days_ahead = (7 + weekday.num_days_from_monday() as i64 - now.weekday().num_days_from_monday() as i64) % 7;
    let candidate = today + ChronoDuration::days(days_ahead);

    if candidate <= now {
        candidate + ChronoDuration::days(SETTLEMENT_WINDOW_DAYS)
    } else {
        candidate
    }
}

/// Most recent weekly boundary at or before `now`
pub fn previous_boundary(now: DateTime<Utc>, weekday: Weekday, hour: u32) -> DateTime<Utc> {
    next_settlement_after(now, weekday, hour) - ChronoDuration::days(SETTLEMENT_WINDOW_DAYS)
}
