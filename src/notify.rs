//! Customer notification emails

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::customers::Customer;
use crate::error::Error;
use crate::postgrest::{format_timestamp, null_as_default, tables, Gateway, TableQuery};

/// Kinds of customer email
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailType {
    PocReminder,
    PocExpired,
    PocExtended,
    CustomerOnboarded,
    PocEnded,
}

impl EmailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailType::PocReminder => "poc_reminder",
            EmailType::PocExpired => "poc_expired",
            EmailType::PocExtended => "poc_extended",
            EmailType::CustomerOnboarded => "customer_onboarded",
            EmailType::PocEnded => "poc_ended",
        }
    }

    /// Subject line for a customer
    pub fn subject(&self, name: &str) -> String {
        match self {
            EmailType::PocReminder => format!("POC Expiry Reminder for {}", name),
            EmailType::PocExpired => format!("POC Expired for {}", name),
            EmailType::PocExtended => format!("POC Extended for {}", name),
            EmailType::CustomerOnboarded => format!("Welcome {}!", name),
            EmailType::PocEnded => format!("POC Ended for {}", name),
        }
    }
}

impl fmt::Display for EmailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who an email goes to; stored as `customer_data` on scheduled emails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    #[serde(rename = "id")]
    pub customer_id: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub customer_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub customer_email: String,
}

impl From<&Customer> for Recipient {
    fn from(customer: &Customer) -> Self {
        Self {
            customer_id: Some(customer.id),
            customer_name: customer.customer_name.clone(),
            customer_email: customer.customer_email.clone(),
        }
    }
}

/// A rendered email ready for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub email_type: EmailType,
    pub to: String,
    pub subject: String,
}

/// Email delivery backend
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, message: &EmailMessage) -> Result<(), Error>;
}

/// Mailer that only writes the message to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(&self, message: &EmailMessage) -> Result<(), Error> {
        log::info!(
            "Sending {} email to {}: {}",
            message.email_type,
            message.to,
            message.subject
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct EmailLogInsert<'a> {
    customer_id: Option<i64>,
    email_type: EmailType,
    recipient: &'a str,
    subject: &'a str,
    status: &'static str,
    sent_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledStatus {
    Pending,
    Sent,
    Failed,
}

/// A row of the `scheduled_emails` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEmail {
    pub id: i64,
    pub email_type: EmailType,
    /// JSON text of the [`Recipient`]
    pub customer_data: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: ScheduledStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct ScheduledInsert {
    email_type: EmailType,
    customer_data: String,
    scheduled_time: String,
    status: ScheduledStatus,
}

#[derive(Debug, Default, Serialize)]
struct ScheduledPatch {
    status: Option<ScheduledStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sent_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

/// Outcome of one pass over the due scheduled emails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

fn decode_scheduled(row: Value) -> Result<(ScheduledEmail, Recipient), Error> {
    let email: ScheduledEmail = serde_json::from_value(row)?;
    let recipient: Recipient = serde_json::from_str(&email.customer_data)?;
    Ok((email, recipient))
}

/// Sends customer emails and keeps the email log
pub struct Notifier {
    gateway: Arc<dyn Gateway>,
    mailer: Arc<dyn Mailer>,
}

impl Notifier {
    pub fn new(gateway: Arc<dyn Gateway>, mailer: Arc<dyn Mailer>) -> Self {
        Self { gateway, mailer }
    }

    /// Deliver an email and record it in `email_logs`
    ///
    /// Delivery failures are returned; a failure to write the log row is only logged.
    pub async fn send(&self, email_type: EmailType, recipient: &Recipient) -> Result<(), Error> {
        let message = EmailMessage {
            email_type,
            to: recipient.customer_email.clone(),
            subject: email_type.subject(&recipient.customer_name),
        };
        self.mailer.deliver(&message).await?;

        let row = EmailLogInsert {
            customer_id: recipient.customer_id,
            email_type,
            recipient: &message.to,
            subject: &message.subject,
            status: "sent",
            sent_at: format_timestamp(Utc::now()),
        };
        let logged: Result<Value, Error> =
            TableQuery::new(self.gateway.clone(), tables::EMAIL_LOGS)
                .insert(&row)
                .await;
        if let Err(e) = logged {
            log::error!("Error logging email: {}", e);
        }
        Ok(())
    }

    /// Like [`Notifier::send`], but failures are logged instead of returned
    pub async fn notify(&self, email_type: EmailType, recipient: &Recipient) {
        if let Err(e) = self.send(email_type, recipient).await {
            log::error!(
                "Error sending {} email to {}: {}",
                email_type,
                recipient.customer_email,
                e
            );
        }
    }

    /// Whether an email of this type was logged for the customer at or after `since`
    pub async fn already_sent(
        &self,
        customer_id: i64,
        email_type: EmailType,
        since: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let rows: Vec<Value> =
            TableQuery::new(self.gateway.clone(), tables::EMAIL_LOGS)
                .select("id")
                .eq("customer_id", customer_id)
                .eq("email_type", email_type)
                .gte("sent_at", format_timestamp(since))
                .limit(1)
                .execute()
                .await?;
        Ok(!rows.is_empty())
    }

    /// Queue an email for the dispatch sweep
    pub async fn schedule(
        &self,
        email_type: EmailType,
        recipient: &Recipient,
        at: DateTime<Utc>,
    ) -> Result<ScheduledEmail, Error> {
        let row = ScheduledInsert {
            email_type,
            customer_data: serde_json::to_string(recipient)?,
            scheduled_time: format_timestamp(at),
            status: ScheduledStatus::Pending,
        };
        TableQuery::new(self.gateway.clone(), tables::SCHEDULED_EMAILS)
            .insert(&row)
            .await
    }

    /// Send every pending email scheduled at or before `now`
    ///
    /// Rows are decoded one by one; a row that cannot be decoded is marked
    /// failed and the rest are still sent.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchReport, Error> {
        let table = TableQuery::new(self.gateway.clone(), tables::SCHEDULED_EMAILS);
        let due: Vec<Value> = table
            .clone()
            .lte("scheduled_time", format_timestamp(now))
            .eq("status", "pending")
            .execute()
            .await?;

        let mut report = DispatchReport::default();
        for row in due {
            let Some(id) = row.get("id").and_then(Value::as_i64) else {
                log::warn!("Skipping scheduled email without id: {}", row);
                continue;
            };

            let outcome = match decode_scheduled(row) {
                Ok((email, recipient)) => self.send(email.email_type, &recipient).await,
                Err(e) => Err(e),
            };

            let patch = match &outcome {
                Ok(()) => ScheduledPatch {
                    status: Some(ScheduledStatus::Sent),
                    sent_at: Some(format_timestamp(now)),
                    ..ScheduledPatch::default()
                },
                Err(e) => {
                    log::error!("Error sending scheduled email {}: {}", id, e);
                    ScheduledPatch {
                        status: Some(ScheduledStatus::Failed),
                        error_message: Some(e.to_string()),
                        ..ScheduledPatch::default()
                    }
                }
            };
            match outcome {
                Ok(()) => report.sent += 1,
                Err(_) => report.failed += 1,
            }

            let marked: Result<Vec<Value>, Error> =
                table.clone().eq("id", id).update(&patch).await;
            if let Err(e) = marked {
                log::error!("Error updating scheduled email {}: {}", id, e);
            }
        }

        if report.sent + report.failed > 0 {
            log::info!(
                "Dispatched scheduled emails: {} sent, {} failed",
                report.sent,
                report.failed
            );
        }
        Ok(report)
    }
}
