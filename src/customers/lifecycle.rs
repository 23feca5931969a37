//! POC state transitions and the customer service

use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;

use crate::cache::TableCache;
use crate::config::DeskOptions;
use crate::customers::{
    ApprovalStatus, Customer, CustomerCounts, CustomerInsert, CustomerPatch, CustomerStatus,
    FinanceStats, NewCustomer, OnboardSource, PocType,
};
use crate::error::Error;
use crate::notify::{EmailType, Notifier};
use crate::postgrest::{tables, Gateway, TableQuery};

/// `date` moved by `days`; `None` when the result is out of range
pub fn add_days(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    Duration::try_days(days).and_then(|delta| date.checked_add_signed(delta))
}

/// End date of an approved POC, when both start and duration are known
pub fn poc_end_date(
    start: Option<NaiveDate>,
    duration: Option<i64>,
) -> Result<Option<NaiveDate>, Error> {
    match (start, duration) {
        (Some(start), Some(days)) => add_days(start, days)
            .map(Some)
            .ok_or_else(|| Error::validation("POC duration moves the end date out of range")),
        _ => Ok(None),
    }
}

/// Changes applied when finance approves a pending customer
pub fn approval_patch(customer: &Customer, now: DateTime<Utc>) -> Result<CustomerPatch, Error> {
    Ok(CustomerPatch {
        approval_status: Some(ApprovalStatus::Approved),
        poc_end_date: Some(poc_end_date(customer.poc_start_date, customer.poc_duration)?),
        approved_at: Some(now),
        ..CustomerPatch::default()
    })
}

pub fn rejection_patch(reason: &str, now: DateTime<Utc>) -> Result<CustomerPatch, Error> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(Error::validation("A rejection reason is required"));
    }
    Ok(CustomerPatch {
        approval_status: Some(ApprovalStatus::Rejected),
        rejection_reason: Some(reason.to_string()),
        rejected_at: Some(now),
        ..CustomerPatch::default()
    })
}

/// Push the end date out by `days` from its current value
pub fn extension_patch(customer: &Customer, days: i64) -> Result<CustomerPatch, Error> {
    if days <= 0 {
        return Err(Error::validation("Extension days must be a positive number"));
    }
    if !customer.is_open_poc() {
        return Err(Error::invalid_transition(format!(
            "{} is not in an open POC",
            customer.customer_name
        )));
    }
    let Some(end) = customer.poc_end_date else {
        return Err(Error::invalid_transition(format!(
            "{} has no POC end date to extend",
            customer.customer_name
        )));
    };
    let new_end = add_days(end, days)
        .ok_or_else(|| Error::validation("Extension moves the end date out of range"))?;
    let extended_days = customer
        .poc_extended_days
        .checked_add(days)
        .ok_or_else(|| Error::validation("Extension days out of range"))?;

    Ok(CustomerPatch {
        poc_end_date: Some(Some(new_end)),
        extension_count: Some(customer.extension_count.saturating_add(1)),
        poc_extended_days: Some(extended_days),
        // the POC runs again once its end date is back in the future
        status: (customer.status == CustomerStatus::Expired).then_some(CustomerStatus::Active),
        ..CustomerPatch::default()
    })
}

pub fn end_patch(customer: &Customer) -> Result<CustomerPatch, Error> {
    if customer.status == CustomerStatus::Closed {
        return Err(Error::invalid_transition(format!(
            "{} is already closed",
            customer.customer_name
        )));
    }
    Ok(CustomerPatch {
        status: Some(CustomerStatus::Closed),
        ..CustomerPatch::default()
    })
}

pub fn conversion_patch(customer: &Customer) -> Result<CustomerPatch, Error> {
    if customer.status == CustomerStatus::Closed {
        return Err(Error::invalid_transition(format!(
            "{} is closed and cannot be onboarded",
            customer.customer_name
        )));
    }
    if !customer.poc_type.is_poc() {
        return Err(Error::invalid_transition(format!(
            "{} is not a POC customer",
            customer.customer_name
        )));
    }
    Ok(CustomerPatch {
        poc_type: Some(PocType::ConvertedToOnboarded),
        status: Some(CustomerStatus::Onboarded),
        ..CustomerPatch::default()
    })
}

pub fn expiry_patch(customer: &Customer) -> Result<CustomerPatch, Error> {
    if !(customer.poc_type.is_poc() && customer.status == CustomerStatus::Active) {
        return Err(Error::invalid_transition(format!(
            "{} is not an active POC",
            customer.customer_name
        )));
    }
    Ok(CustomerPatch {
        status: Some(CustomerStatus::Expired),
        ..CustomerPatch::default()
    })
}

/// Creates customers and drives them through approval and the POC lifecycle
pub struct CustomerService {
    gateway: Arc<dyn Gateway>,
    cache: Arc<TableCache<Customer>>,
    notifier: Arc<Notifier>,
    options: DeskOptions,
}

impl CustomerService {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        cache: Arc<TableCache<Customer>>,
        notifier: Arc<Notifier>,
        options: DeskOptions,
    ) -> Self {
        Self {
            gateway,
            cache,
            notifier,
            options,
        }
    }

    /// The cached customer set
    pub fn cache(&self) -> &Arc<TableCache<Customer>> {
        &self.cache
    }

    pub async fn reload(&self) -> Result<usize, Error> {
        self.cache.reload().await
    }

    fn table(&self) -> TableQuery {
        TableQuery::new(self.gateway.clone(), tables::CUSTOMERS)
    }

    /// Submit a new customer for finance approval
    pub async fn create(&self, form: NewCustomer) -> Result<Customer, Error> {
        form.validate()?;

        let direct = form.poc_type == PocType::DirectOnboarding;
        let duration = form
            .poc_duration
            .filter(|days| *days > 0)
            .unwrap_or(self.options.default_poc_days);
        poc_end_date(form.poc_start_date, Some(duration))?;

        let row = CustomerInsert {
            account_manager_name: form.account_manager_name,
            account_manager_id: form.account_manager_id,
            customer_name: form.customer_name.trim().to_string(),
            customer_mobile: form.customer_mobile,
            customer_email: form.customer_email.trim().to_string(),
            lead_sources: form.lead_sources,
            requirements: form.requirements,
            poc_type: form.poc_type,
            poc_duration: duration,
            poc_start_date: form.poc_start_date,
            poc_end_date: None,
            status: if direct {
                CustomerStatus::Onboarded
            } else {
                CustomerStatus::Active
            },
            onboard_source: if direct {
                OnboardSource::Direct
            } else {
                OnboardSource::PocConversion
            },
            approval_status: ApprovalStatus::Pending,
            extension_count: 0,
            poc_extended_days: 0,
            email_notifications_sent: 0,
        };

        let customer: Customer = self.table().insert(&row).await?;
        log::info!(
            "Customer \"{}\" submitted for approval",
            customer.customer_name
        );
        self.refresh().await;
        Ok(customer)
    }

    /// Approve a pending customer and fix its POC end date
    pub async fn approve(&self, id: i64) -> Result<Customer, Error> {
        let customer = self.pending_by_id(id)?;
        let patch = approval_patch(&customer, Utc::now())?;
        let customer = self.apply(&customer, &patch).await?;

        log::info!("Customer approved: {}", customer.customer_name);
        self.notifier
            .notify(EmailType::CustomerOnboarded, &(&customer).into())
            .await;
        Ok(customer)
    }

    /// Reject a pending customer; the reason is mandatory
    pub async fn reject(&self, id: i64, reason: &str) -> Result<Customer, Error> {
        let customer = self.pending_by_id(id)?;
        let patch = rejection_patch(reason, Utc::now())?;
        let customer = self.apply(&customer, &patch).await?;

        log::info!("Customer rejected: {}", customer.customer_name);
        Ok(customer)
    }

    /// Extend the POC by `days` (the configured default when `None`)
    pub async fn extend(&self, id: i64, days: Option<i64>) -> Result<Customer, Error> {
        let customer = self.approved_by_id(id)?;
        let days = days.unwrap_or(self.options.default_extension_days);
        let patch = extension_patch(&customer, days)?;
        let customer = self.apply(&customer, &patch).await?;

        log::info!(
            "POC extended by {} days for {}",
            days,
            customer.customer_name
        );
        self.notifier
            .notify(EmailType::PocExtended, &(&customer).into())
            .await;
        Ok(customer)
    }

    /// Close the POC regardless of remaining time
    pub async fn end(&self, id: i64) -> Result<Customer, Error> {
        let customer = self.approved_by_id(id)?;
        let patch = end_patch(&customer)?;
        let customer = self.apply(&customer, &patch).await?;

        log::info!("POC ended for {}", customer.customer_name);
        self.notifier
            .notify(EmailType::PocEnded, &(&customer).into())
            .await;
        Ok(customer)
    }

    pub async fn convert_to_onboarded(&self, id: i64) -> Result<Customer, Error> {
        let customer = self.approved_by_id(id)?;
        let patch = conversion_patch(&customer)?;
        let customer = self.apply(&customer, &patch).await?;

        log::info!("Customer onboarded: {}", customer.customer_name);
        self.notifier
            .notify(EmailType::CustomerOnboarded, &(&customer).into())
            .await;
        Ok(customer)
    }

    /// Mark an active POC as expired; no notification is sent here
    pub async fn expire(&self, id: i64) -> Result<Customer, Error> {
        let customer = self.approved_by_id(id)?;
        let patch = expiry_patch(&customer)?;
        self.apply(&customer, &patch).await
    }

    async fn apply(&self, customer: &Customer, patch: &CustomerPatch) -> Result<Customer, Error> {
        let updated: Vec<Customer> = self.table().eq("id", customer.id).update(patch).await?;
        let updated = updated
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("Customer not found"))?;
        self.refresh().await;
        Ok(updated)
    }

    /// Reload after a successful write; the write already happened, so only log
    async fn refresh(&self) {
        if let Err(e) = self.cache.reload().await {
            log::error!("Error reloading customers: {}", e);
        }
    }

    fn pending_by_id(&self, id: i64) -> Result<Customer, Error> {
        self.cache
            .find(|c| c.id == id && c.approval_status == ApprovalStatus::Pending)
            .ok_or_else(|| Error::not_found("Customer not found"))
    }

    fn approved_by_id(&self, id: i64) -> Result<Customer, Error> {
        self.cache
            .find(|c| c.id == id && c.approval_status == ApprovalStatus::Approved)
            .ok_or_else(|| Error::not_found("Customer not found"))
    }

    pub fn by_id(&self, id: i64) -> Option<Customer> {
        self.cache.by_id(id)
    }

    pub fn pending(&self) -> Vec<Customer> {
        self.cache
            .filter(|c| c.approval_status == ApprovalStatus::Pending)
    }

    pub fn approved(&self) -> Vec<Customer> {
        self.cache
            .filter(|c| c.approval_status == ApprovalStatus::Approved)
    }

    pub fn rejected(&self) -> Vec<Customer> {
        self.cache
            .filter(|c| c.approval_status == ApprovalStatus::Rejected)
    }

    /// Approved free/paid trials that are not closed
    pub fn poc(&self) -> Vec<Customer> {
        self.cache
            .filter(|c| c.approval_status == ApprovalStatus::Approved && c.is_open_poc())
    }

    pub fn onboarded(&self) -> Vec<Customer> {
        self.cache.filter(|c| {
            c.approval_status == ApprovalStatus::Approved
                && (c.poc_type == PocType::DirectOnboarding
                    || c.status == CustomerStatus::Onboarded)
        })
    }

    pub fn closed(&self) -> Vec<Customer> {
        self.cache.filter(|c| {
            c.approval_status == ApprovalStatus::Approved && c.status == CustomerStatus::Closed
        })
    }

    /// Search approved customers
    pub fn search(&self, query: &str) -> Vec<Customer> {
        self.cache
            .search(query)
            .into_iter()
            .filter(|c| c.approval_status == ApprovalStatus::Approved)
            .collect()
    }

    pub fn counts(&self) -> CustomerCounts {
        CustomerCounts {
            all: self.approved().len(),
            poc: self.poc().len(),
            onboarded: self.onboarded().len(),
            closed: self.closed().len(),
        }
    }

    pub fn finance_stats(&self) -> FinanceStats {
        FinanceStats {
            pending: self.pending().len(),
            approved: self.approved().len(),
            rejected: self.rejected().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn customer(status: &str, poc_type: &str, end: Option<&str>) -> Customer {
        serde_json::from_value(json!({
            "id": 1,
            "customer_name": "Acme",
            "customer_email": "ops@acme.test",
            "poc_type": poc_type,
            "poc_duration": 30,
            "poc_start_date": "2024-01-01",
            "poc_end_date": end,
            "status": status,
            "approval_status": "approved",
            "extension_count": 1,
            "poc_extended_days": 10
        }))
        .unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_end_date_needs_start_and_duration() {
        assert_eq!(
            poc_end_date(Some(date("2024-01-01")), Some(30)).unwrap(),
            Some(date("2024-01-31"))
        );
        assert_eq!(poc_end_date(None, Some(30)).unwrap(), None);
        assert_eq!(poc_end_date(Some(date("2024-01-01")), None).unwrap(), None);
        assert!(matches!(
            poc_end_date(Some(date("2024-01-01")), Some(i64::MAX / 2)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_extension_is_relative_to_current_end() {
        let c = customer("active", "free_poc", Some("2024-02-10"));
        let patch = extension_patch(&c, 15).unwrap();
        assert_eq!(patch.poc_end_date, Some(Some(date("2024-02-25"))));
        assert_eq!(patch.extension_count, Some(2));
        assert_eq!(patch.poc_extended_days, Some(25));
        assert_eq!(patch.status, None);
    }

    #[test]
    fn test_huge_extension_is_a_validation_error() {
        let c = customer("active", "free_poc", Some("2024-02-10"));
        assert!(matches!(
            extension_patch(&c, i64::MAX / 2),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            extension_patch(&c, i64::MAX),
            Err(Error::Validation(_))
        ));

        let mut c = customer("active", "free_poc", Some("2024-02-10"));
        c.poc_extended_days = i64::MAX;
        assert!(matches!(extension_patch(&c, 1), Err(Error::Validation(_))));
    }

    #[test]
    fn test_extension_reactivates_expired_poc() {
        let c = customer("expired", "paid_poc", Some("2024-02-10"));
        let patch = extension_patch(&c, 5).unwrap();
        assert_eq!(patch.status, Some(CustomerStatus::Active));
    }

    #[test]
    fn test_extension_rejections() {
        let c = customer("active", "free_poc", Some("2024-02-10"));
        assert!(matches!(extension_patch(&c, 0), Err(Error::Validation(_))));

        let c = customer("active", "free_poc", None);
        assert!(matches!(
            extension_patch(&c, 5),
            Err(Error::InvalidTransition(_))
        ));

        let c = customer("closed", "free_poc", Some("2024-02-10"));
        assert!(matches!(
            extension_patch(&c, 5),
            Err(Error::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_terminal_states() {
        let closed = customer("closed", "free_poc", Some("2024-02-10"));
        assert!(end_patch(&closed).is_err());
        assert!(conversion_patch(&closed).is_err());

        let onboarded = customer("onboarded", "converted_to_onboarded", None);
        assert!(conversion_patch(&onboarded).is_err());
        assert!(end_patch(&onboarded).is_ok());
    }

    #[test]
    fn test_rejection_requires_reason() {
        assert!(rejection_patch("  ", Utc::now()).is_err());
        let patch = rejection_patch("Budget not approved", Utc::now()).unwrap();
        assert_eq!(patch.approval_status, Some(ApprovalStatus::Rejected));
    }
}
