use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use fleetdesk::config::DeskOptions;
use fleetdesk::customers::{CustomerStatus, PocType};
use fleetdesk::error::Error;
use fleetdesk::notify::{EmailMessage, EmailType, Mailer, Recipient};
use fleetdesk::postgrest::tables;
use fleetdesk::prelude::*;

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<EmailMessage>>,
    reject: Option<String>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn deliver(&self, message: &EmailMessage) -> Result<(), Error> {
        if let Some(address) = &self.reject {
            if &message.to == address {
                return Err(Error::general("mailbox unavailable"));
            }
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn recipient(id: i64, email: &str) -> Recipient {
    Recipient {
        customer_id: Some(id),
        customer_name: "Acme".to_string(),
        customer_email: email.to_string(),
    }
}

#[tokio::test]
async fn test_dispatch_sends_due_emails_once() {
    let mailer = Arc::new(RecordingMailer {
        reject: Some("bounce@acme.test".to_string()),
        ..RecordingMailer::default()
    });
    let (desk, gateway) = FleetDesk::in_memory_with_mailer(DeskOptions::default(), mailer.clone());
    let now = Utc::now();
    let notifier = desk.notifier();

    notifier
        .schedule(EmailType::PocReminder, &recipient(1, "ops@acme.test"), now - Duration::hours(1))
        .await
        .unwrap();
    notifier
        .schedule(EmailType::PocReminder, &recipient(2, "bounce@acme.test"), now - Duration::minutes(5))
        .await
        .unwrap();
    notifier
        .schedule(EmailType::PocExpired, &recipient(3, "later@acme.test"), now + Duration::days(1))
        .await
        .unwrap();

    let scheduler = desk.scheduler();
    let report = scheduler.dispatch_sweep(now).await.unwrap();
    assert_eq!((report.sent, report.failed), (1, 1));

    let again = scheduler.dispatch_sweep(now).await.unwrap();
    assert_eq!((again.sent, again.failed), (0, 0));

    let statuses: Vec<(String, Value)> = gateway
        .rows(tables::SCHEDULED_EMAILS)
        .into_iter()
        .map(|row| (row["status"].as_str().unwrap_or_default().to_string(), row["error_message"].clone()))
        .collect();
    assert_eq!(statuses[0].0, "sent");
    assert_eq!(statuses[1].0, "failed");
    assert_eq!(statuses[1].1, json!("mailbox unavailable"));
    assert_eq!(statuses[2].0, "pending");

    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ops@acme.test");
    assert_eq!(sent[0].subject, EmailType::PocReminder.subject("Acme"));
}

#[tokio::test]
async fn test_run_once_combines_every_sweep() {
    let mailer = Arc::new(RecordingMailer::default());
    let (desk, _gateway) = FleetDesk::in_memory_with_mailer(DeskOptions::default(), mailer.clone());
    let today = Utc::now().date_naive();

    let form = NewCustomer::new("Lapsed", "lapsed@fleet.test", PocType::FreePoc)
        .with_poc(Some(today - Duration::days(45)), Some(30));
    let lapsed = desk.customers().create(form).await.unwrap();
    desk.customers().approve(lapsed.id).await.unwrap();

    let form = NewCustomer::new("Ending", "ending@fleet.test", PocType::PaidPoc)
        .with_poc(Some(today - Duration::days(28)), Some(30));
    let ending = desk.customers().create(form).await.unwrap();
    desk.customers().approve(ending.id).await.unwrap();

    let _: Value = desk
        .from(tables::STOCK)
        .insert(&json!({
            "device_model_no": "GT06N",
            "device_registration_number": "ORPHAN-1",
            "device_imei": "356938035643809",
            "device_condition": "new",
            "current_status": "available",
        }))
        .await
        .unwrap();

    let summary = desk.scheduler().run_once().await;

    assert_eq!(summary.expired, vec![lapsed.id]);
    assert_eq!(summary.reminded, vec![ending.id]);
    assert_eq!(summary.reconciled.inward_restored, vec!["ORPHAN-1".to_string()]);
    assert_eq!(
        desk.customers().by_id(lapsed.id).unwrap().status,
        CustomerStatus::Expired
    );

    let types: Vec<EmailType> = mailer.sent.lock().unwrap().iter().map(|m| m.email_type).collect();
    assert!(types.contains(&EmailType::PocExpired));
    assert!(types.contains(&EmailType::PocReminder));
}

#[tokio::test]
async fn test_expiry_leaves_direct_customers_alone() {
    let (desk, _gateway) = FleetDesk::in_memory(DeskOptions::default());
    let form = NewCustomer::new("Direct", "direct@fleet.test", PocType::DirectOnboarding)
        .with_poc(NaiveDate::from_ymd_opt(2020, 1, 1), Some(30));
    let created = desk.customers().create(form).await.unwrap();
    desk.customers().approve(created.id).await.unwrap();

    let expired = desk
        .scheduler()
        .expiry_sweep(Utc::now().date_naive())
        .await
        .unwrap();

    assert!(expired.is_empty());
    assert_eq!(
        desk.customers().by_id(created.id).unwrap().status,
        CustomerStatus::Onboarded
    );
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let options = DeskOptions::default().with_sweep_interval(std::time::Duration::from_millis(20));
    let (desk, _gateway) = FleetDesk::in_memory(options);
    let scheduler = desk.scheduler();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_watched_caches_follow_direct_writes() {
    let (desk, _gateway) = FleetDesk::in_memory(DeskOptions::default());
    let handles = desk.watch();

    let _: Value = desk
        .from(tables::LEADS)
        .insert(&json!({
            "type": "outbound",
            "customer_name": "Written Elsewhere",
            "contact": "w@x.com",
            "status": "New"
        }))
        .await
        .unwrap();

    let mut seen = false;
    for _ in 0..50 {
        if desk.leads().cache().len() == 1 {
            seen = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(seen, "lead cache never picked up the insert");

    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn test_degenerate_sweep_settings_do_not_panic() {
    let mut options = DeskOptions::default();
    options.sweep_interval = std::time::Duration::ZERO;
    options.reminder_window_days = i64::MAX;
    let (desk, _gateway) = FleetDesk::in_memory(options);
    let today = Utc::now().date_naive();

    let form = NewCustomer::new("Far Off", "far@fleet.test", PocType::FreePoc)
        .with_poc(Some(today), Some(200));
    let created = desk.customers().create(form).await.unwrap();
    desk.customers().approve(created.id).await.unwrap();

    let scheduler = desk.scheduler();
    assert_eq!(scheduler.reminder_sweep(today).await.unwrap(), vec![created.id]);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
}
