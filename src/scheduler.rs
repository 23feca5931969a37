//! Periodic sweeps: POC expiry, expiry reminders, scheduled emails and ledger repair

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{DeskOptions, MAX_REMINDER_WINDOW_DAYS, MIN_SWEEP_INTERVAL};
use crate::customers::{CustomerService, CustomerStatus};
use crate::error::Error;
use crate::inventory::{Inventory, ReconcileReport};
use crate::notify::{DispatchReport, EmailType, Notifier};

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN))
}

/// Results of one pass over every sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub expired: Vec<i64>,
    pub reminded: Vec<i64>,
    pub dispatched: DispatchReport,
    pub reconciled: ReconcileReport,
}

pub struct Scheduler {
    customers: Arc<CustomerService>,
    inventory: Arc<Inventory>,
    notifier: Arc<Notifier>,
    options: DeskOptions,
}

impl Scheduler {
    pub fn new(
        customers: Arc<CustomerService>,
        inventory: Arc<Inventory>,
        notifier: Arc<Notifier>,
        options: DeskOptions,
    ) -> Self {
        Self {
            customers,
            inventory,
            notifier,
            options,
        }
    }

    /// Expire active POCs whose end date has been reached
    ///
    /// Each customer gets one `poc_expired` email per day at most. Returns the
    /// ids that were expired.
    pub async fn expiry_sweep(&self, today: NaiveDate) -> Result<Vec<i64>, Error> {
        self.customers.reload().await?;

        let due = self.customers.approved().into_iter().filter(|c| {
            c.poc_type.is_poc()
                && c.status == CustomerStatus::Active
                && c.poc_end_date.map(|end| end <= today).unwrap_or(false)
        });

        let mut expired = Vec::new();
        for customer in due {
            let notified = self
                .notifier
                .already_sent(customer.id, EmailType::PocExpired, start_of_day(today))
                .await;
            match notified {
                Ok(false) => {
                    self.notifier
                        .notify(EmailType::PocExpired, &(&customer).into())
                        .await
                }
                Ok(true) => {}
                Err(e) => {
                    log::error!("Error checking email log for {}: {}", customer.id, e);
                    continue;
                }
            }

            match self.customers.expire(customer.id).await {
                Ok(_) => expired.push(customer.id),
                Err(e) => log::error!("Error expiring POC for {}: {}", customer.customer_name, e),
            }
        }

        if !expired.is_empty() {
            log::info!("{} POC(s) have expired", expired.len());
        }
        Ok(expired)
    }

    /// Remind customers whose POC ends within the reminder window
    ///
    /// One reminder per end date: an extension moves the end date and makes
    /// the customer eligible again.
    pub async fn reminder_sweep(&self, today: NaiveDate) -> Result<Vec<i64>, Error> {
        self.customers.reload().await?;

        let window_days = self
            .options
            .reminder_window_days
            .clamp(0, MAX_REMINDER_WINDOW_DAYS);
        let window = Duration::days(window_days);
        let horizon = today + window;
        let upcoming = self.customers.approved().into_iter().filter(|c| {
            c.is_open_poc()
                && c.poc_end_date
                    .map(|end| end > today && end <= horizon)
                    .unwrap_or(false)
        });

        let mut reminded = Vec::new();
        for customer in upcoming {
            let Some(end) = customer.poc_end_date else {
                continue;
            };
            let since = start_of_day(end - window);
            match self
                .notifier
                .already_sent(customer.id, EmailType::PocReminder, since)
                .await
            {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Error checking email log for {}: {}", customer.id, e);
                    continue;
                }
            }

            match self
                .notifier
                .send(EmailType::PocReminder, &(&customer).into())
                .await
            {
                Ok(()) => reminded.push(customer.id),
                Err(e) => log::error!(
                    "Error sending reminder to {}: {}",
                    customer.customer_email,
                    e
                ),
            }
        }
        Ok(reminded)
    }

    /// Send scheduled emails that are due
    pub async fn dispatch_sweep(&self, now: DateTime<Utc>) -> Result<DispatchReport, Error> {
        self.notifier.dispatch_due(now).await
    }

    /// Repair devices listed in both ledgers or in neither
    pub async fn reconcile_sweep(&self) -> Result<ReconcileReport, Error> {
        self.inventory.reconcile_ledgers().await
    }

    /// Run every sweep once; a failing sweep is logged and the others still run
    pub async fn run_once(&self) -> SweepSummary {
        let now = Utc::now();
        let today = now.date_naive();
        let mut summary = SweepSummary::default();

        match self.expiry_sweep(today).await {
            Ok(ids) => summary.expired = ids,
            Err(e) => log::error!("Error checking expired POCs: {}", e),
        }
        match self.reminder_sweep(today).await {
            Ok(ids) => summary.reminded = ids,
            Err(e) => log::error!("Error checking POC reminders: {}", e),
        }
        match self.dispatch_sweep(now).await {
            Ok(report) => summary.dispatched = report,
            Err(e) => log::error!("Error processing scheduled emails: {}", e),
        }
        match self.reconcile_sweep().await {
            Ok(report) => summary.reconciled = report,
            Err(e) => log::error!("Error reconciling ledgers: {}", e),
        }

        summary
    }

    /// Run the sweeps every `sweep_interval` until `shutdown` turns true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.options.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!(
            "Scheduler started, sweeping every {:?}",
            period
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.run_once().await;
                    log::debug!("Sweep finished: {:?}", summary);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::info!("Scheduler stopped");
    }
}
