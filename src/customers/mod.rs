//! Customers and the POC pipeline

mod lifecycle;

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::{Record, Searchable};
use crate::error::Error;
use crate::postgrest::null_as_default;

pub use lifecycle::*;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

/// How a customer entered the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PocType {
    FreePoc,
    PaidPoc,
    DirectOnboarding,
    ConvertedToOnboarded,
}

impl PocType {
    /// Free and paid trials are tracked by the POC sweeps
    pub fn is_poc(&self) -> bool {
        matches!(self, PocType::FreePoc | PocType::PaidPoc)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PocType::FreePoc => "free_poc",
            PocType::PaidPoc => "paid_poc",
            PocType::DirectOnboarding => "direct_onboarding",
            PocType::ConvertedToOnboarded => "converted_to_onboarded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerStatus {
    Active,
    Onboarded,
    Expired,
    Closed,
}

impl CustomerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerStatus::Active => "active",
            CustomerStatus::Onboarded => "onboarded",
            CustomerStatus::Expired => "expired",
            CustomerStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardSource {
    Direct,
    PocConversion,
    LeadConversion,
}

/// A row of the `customers` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub account_manager_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub account_manager_id: String,
    pub customer_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub customer_email: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub customer_mobile: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub lead_sources: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub requirements: Vec<String>,
    pub poc_type: PocType,
    pub poc_duration: Option<i64>,
    pub poc_start_date: Option<NaiveDate>,
    pub poc_end_date: Option<NaiveDate>,
    pub status: CustomerStatus,
    pub onboard_source: Option<OnboardSource>,
    pub approval_status: ApprovalStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub extension_count: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub poc_extended_days: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub email_notifications_sent: i64,
    pub rejection_reason: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Customer {
    /// Still in a POC trial that the sweeps should look at
    pub fn is_open_poc(&self) -> bool {
        self.poc_type.is_poc() && self.status != CustomerStatus::Closed
    }
}

impl Record for Customer {
    fn id(&self) -> i64 {
        self.id
    }
}

impl Searchable for Customer {
    fn search_fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.customer_name.clone(),
            self.customer_email.clone(),
            self.customer_mobile.clone(),
            self.account_manager_name.clone(),
            self.poc_type.as_str().to_string(),
            self.status.as_str().to_string(),
        ];
        fields.extend(self.lead_sources.iter().cloned());
        fields.extend(self.requirements.iter().cloned());
        fields
    }
}

/// Form input for a new customer
#[derive(Debug, Clone, PartialEq)]
pub struct NewCustomer {
    pub account_manager_name: String,
    pub account_manager_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_mobile: String,
    pub lead_sources: Vec<String>,
    pub requirements: Vec<String>,
    pub poc_type: PocType,
    /// Trial length in days; `None` or a non-positive value falls back to the default
    pub poc_duration: Option<i64>,
    pub poc_start_date: Option<NaiveDate>,
}

impl NewCustomer {
    pub fn new(name: &str, email: &str, poc_type: PocType) -> Self {
        Self {
            account_manager_name: String::new(),
            account_manager_id: String::new(),
            customer_name: name.to_string(),
            customer_email: email.to_string(),
            customer_mobile: String::new(),
            lead_sources: Vec::new(),
            requirements: Vec::new(),
            poc_type,
            poc_duration: None,
            poc_start_date: None,
        }
    }

    pub fn with_account_manager(mut self, name: &str, id: &str) -> Self {
        self.account_manager_name = name.to_string();
        self.account_manager_id = id.to_string();
        self
    }

    pub fn with_mobile(mut self, mobile: &str) -> Self {
        self.customer_mobile = mobile.to_string();
        self
    }

    pub fn with_lead_sources(mut self, sources: &[&str]) -> Self {
        self.lead_sources = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_requirements(mut self, requirements: &[&str]) -> Self {
        self.requirements = requirements.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_poc(mut self, start: Option<NaiveDate>, duration: Option<i64>) -> Self {
        self.poc_start_date = start;
        self.poc_duration = duration;
        self
    }

    /// Check the fields an operator must fill in
    pub fn validate(&self) -> Result<(), Error> {
        if self.customer_name.trim().is_empty() {
            return Err(Error::validation("Customer name is required"));
        }
        validate_email(&self.customer_email)
    }
}

/// Reject addresses that are obviously not email addresses
pub fn validate_email(email: &str) -> Result<(), Error> {
    if EMAIL_RE.is_match(email.trim()) {
        Ok(())
    } else {
        Err(Error::validation(format!("Invalid email address: \"{}\"", email)))
    }
}

/// Row written when a customer is created
#[derive(Debug, Clone, Serialize)]
pub struct CustomerInsert {
    pub account_manager_name: String,
    pub account_manager_id: String,
    pub customer_name: String,
    pub customer_mobile: String,
    pub customer_email: String,
    pub lead_sources: Vec<String>,
    pub requirements: Vec<String>,
    pub poc_type: PocType,
    pub poc_duration: i64,
    pub poc_start_date: Option<NaiveDate>,
    pub poc_end_date: Option<NaiveDate>,
    pub status: CustomerStatus,
    pub onboard_source: OnboardSource,
    pub approval_status: ApprovalStatus,
    pub extension_count: i64,
    pub poc_extended_days: i64,
    pub email_notifications_sent: i64,
}

/// Partial update of a customer row; unset fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CustomerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_status: Option<ApprovalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CustomerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poc_type: Option<PocType>,
    /// `Some(None)` clears the end date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poc_end_date: Option<Option<NaiveDate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poc_extended_days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
}

/// Tab counts over approved customers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CustomerCounts {
    pub all: usize,
    pub poc: usize,
    pub onboarded: usize,
    pub closed: usize,
}

/// Approval queue summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinanceStats {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_customer_tolerates_null_columns() {
        let customer: Customer = serde_json::from_value(json!({
            "id": 1,
            "customer_name": "Acme Logistics",
            "customer_email": "ops@acme.test",
            "customer_mobile": null,
            "lead_sources": null,
            "poc_type": "free_poc",
            "poc_duration": 30,
            "poc_start_date": "2024-01-01",
            "poc_end_date": null,
            "status": "active",
            "onboard_source": "poc_conversion",
            "approval_status": "pending",
            "created_at": "2024-01-01T08:00:00Z"
        }))
        .unwrap();

        assert_eq!(customer.customer_mobile, "");
        assert!(customer.lead_sources.is_empty());
        assert_eq!(customer.extension_count, 0);
        assert!(customer.is_open_poc());
    }

    #[test]
    fn test_patch_serializes_only_set_fields() {
        let patch = CustomerPatch {
            status: Some(CustomerStatus::Closed),
            poc_end_date: Some(None),
            ..CustomerPatch::default()
        };
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({ "status": "closed", "poc_end_date": null })
        );
    }

    #[test]
    fn test_new_customer_validation() {
        assert!(NewCustomer::new("Acme", "ops@acme.test", PocType::PaidPoc)
            .validate()
            .is_ok());
        assert!(matches!(
            NewCustomer::new(" ", "ops@acme.test", PocType::PaidPoc).validate(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            NewCustomer::new("Acme", "not-an-email", PocType::PaidPoc).validate(),
            Err(Error::Validation(_))
        ));
    }
}
