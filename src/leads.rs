//! Sales leads and their conversion into customers

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::cache::{Record, Searchable, TableCache};
use crate::config::DeskOptions;
use crate::customers::{
    ApprovalStatus, Customer, CustomerInsert, CustomerStatus, OnboardSource, PocType,
};
use crate::error::Error;
use crate::postgrest::{null_as_default, tables, Gateway, TableQuery};
use crate::Confirmation;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadType {
    Inbound,
    Outbound,
}

impl LeadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadType::Inbound => "inbound",
            LeadType::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadStatus {
    #[serde(rename = "New")]
    New,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "Qualified")]
    Qualified,
    #[serde(rename = "Not Qualified")]
    NotQualified,
    #[serde(rename = "Converted")]
    Converted,
    #[serde(rename = "Closed")]
    Closed,
}

impl LeadStatus {
    pub fn label(&self) -> &'static str {
        match self {
            LeadStatus::New => "New",
            LeadStatus::InProgress => "In Progress",
            LeadStatus::Qualified => "Qualified",
            LeadStatus::NotQualified => "Not Qualified",
            LeadStatus::Converted => "Converted",
            LeadStatus::Closed => "Closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Converted | LeadStatus::Closed)
    }
}

/// A row of the `leads` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    #[serde(rename = "type")]
    pub lead_type: LeadType,
    pub customer_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub contact: String,
    pub fleet_size: Option<i64>,
    pub status: LeadStatus,
    pub created_at: Option<DateTime<Utc>>,
}

impl Record for Lead {
    fn id(&self) -> i64 {
        self.id
    }
}

impl Searchable for Lead {
    fn search_fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.customer_name.clone(),
            self.contact.clone(),
            self.status.label().to_string(),
            self.lead_type.as_str().to_string(),
        ];
        if let Some(size) = self.fleet_size {
            fields.push(size.to_string());
        }
        fields
    }
}

/// Form input for a new lead
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewLead {
    #[serde(rename = "type")]
    pub lead_type: LeadType,
    pub customer_name: String,
    pub contact: String,
    pub fleet_size: Option<i64>,
}

#[derive(Debug, Serialize)]
struct LeadInsert<'a> {
    #[serde(flatten)]
    lead: &'a NewLead,
    status: LeadStatus,
}

#[derive(Debug, Serialize)]
struct LeadStatusPatch {
    status: LeadStatus,
}

/// Customer row synthesised from a lead, pending finance approval
pub fn customer_from_lead(lead: &Lead, today: chrono::NaiveDate, poc_days: i64) -> CustomerInsert {
    let contact = lead.contact.trim();
    let (email, mobile) = if contact.contains('@') {
        (contact.to_string(), String::new())
    } else {
        let lowered = lead.customer_name.trim().to_lowercase();
        let local = WHITESPACE.replace_all(&lowered, ".");
        (format!("{}@example.com", local), contact.to_string())
    };

    CustomerInsert {
        account_manager_name: "Lead Converter".to_string(),
        account_manager_id: "LC001".to_string(),
        customer_name: lead.customer_name.clone(),
        customer_mobile: mobile,
        customer_email: email,
        lead_sources: vec!["lead_conversion".to_string()],
        requirements: Vec::new(),
        poc_type: PocType::FreePoc,
        poc_duration: poc_days,
        poc_start_date: Some(today),
        poc_end_date: None,
        status: CustomerStatus::Active,
        onboard_source: OnboardSource::LeadConversion,
        approval_status: ApprovalStatus::Pending,
        extension_count: 0,
        poc_extended_days: 0,
        email_notifications_sent: 0,
    }
}

/// Lead capture, conversion and closing
pub struct LeadService {
    gateway: Arc<dyn Gateway>,
    cache: Arc<TableCache<Lead>>,
    customers: Arc<TableCache<Customer>>,
    options: DeskOptions,
}

impl LeadService {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        cache: Arc<TableCache<Lead>>,
        customers: Arc<TableCache<Customer>>,
        options: DeskOptions,
    ) -> Self {
        Self {
            gateway,
            cache,
            customers,
            options,
        }
    }

    pub fn cache(&self) -> &Arc<TableCache<Lead>> {
        &self.cache
    }

    pub async fn reload(&self) -> Result<usize, Error> {
        self.cache.reload().await
    }

    fn table(&self) -> TableQuery {
        TableQuery::new(self.gateway.clone(), tables::LEADS)
    }

    pub async fn create(&self, form: NewLead) -> Result<Lead, Error> {
        if form.customer_name.trim().is_empty() {
            return Err(Error::validation("Customer name is required"));
        }
        if form.contact.trim().is_empty() {
            return Err(Error::validation("Contact is required"));
        }

        let lead: Lead = self
            .table()
            .insert(&LeadInsert {
                lead: &form,
                status: LeadStatus::New,
            })
            .await?;
        log::info!("Lead \"{}\" added", lead.customer_name);
        self.refresh().await;
        Ok(lead)
    }

    /// Create a pending customer from the lead and mark the lead converted
    ///
    /// If the lead cannot be marked, the new customer row is removed again.
    pub async fn convert_to_customer(&self, id: i64) -> Result<Customer, Error> {
        let lead = self
            .cache
            .by_id(id)
            .ok_or_else(|| Error::not_found("Lead not found"))?;
        if lead.status.is_terminal() {
            return Err(Error::invalid_transition(format!(
                "Lead \"{}\" is already {}",
                lead.customer_name,
                lead.status.label()
            )));
        }

        let row = customer_from_lead(&lead, Utc::now().date_naive(), self.options.default_poc_days);
        let customer: Customer = TableQuery::new(self.gateway.clone(), tables::CUSTOMERS)
            .insert(&row)
            .await?;

        let marked: Result<Vec<Lead>, Error> = self
            .table()
            .eq("id", lead.id)
            .update(&LeadStatusPatch {
                status: LeadStatus::Converted,
            })
            .await;
        let failure = match marked {
            Ok(rows) if !rows.is_empty() => None,
            Ok(_) => Some(Error::not_found("Lead not found")),
            Err(e) => Some(e),
        };

        if let Some(e) = failure {
            log::error!("Error updating lead {}: {}", lead.id, e);
            let undone: Result<Vec<Value>, Error> =
                TableQuery::new(self.gateway.clone(), tables::CUSTOMERS)
                    .eq("id", customer.id)
                    .delete()
                    .await;
            if let Err(undo) = undone {
                return Err(Error::inconsistent(format!(
                    "customer {} was created for lead {} but the lead could not be marked converted ({}) and the customer could not be removed ({})",
                    customer.id, lead.id, e, undo
                )));
            }
            return Err(e);
        }

        log::info!(
            "Lead converted to customer: {}. Awaiting approval.",
            lead.customer_name
        );
        self.refresh().await;
        if let Err(e) = self.customers.reload().await {
            log::error!("Error reloading customers: {}", e);
        }
        Ok(customer)
    }

    /// Close a lead once the operator confirms; `Ok(false)` when declined
    pub async fn close(&self, id: i64, confirmation: Confirmation) -> Result<bool, Error> {
        let lead = self
            .cache
            .by_id(id)
            .ok_or_else(|| Error::not_found("Lead not found"))?;
        if confirmation == Confirmation::Declined {
            return Ok(false);
        }
        if lead.status == LeadStatus::Closed {
            return Ok(true);
        }

        let updated: Vec<Lead> = self
            .table()
            .eq("id", lead.id)
            .update(&LeadStatusPatch {
                status: LeadStatus::Closed,
            })
            .await?;
        if updated.is_empty() {
            return Err(Error::not_found("Lead not found"));
        }
        log::info!("Lead \"{}\" closed", lead.customer_name);
        self.refresh().await;
        Ok(true)
    }

    /// Leads that are not closed
    pub fn ongoing(&self) -> Vec<Lead> {
        self.cache.filter(|lead| lead.status != LeadStatus::Closed)
    }

    pub fn search(&self, query: &str) -> Vec<Lead> {
        self.cache.search(query)
    }

    async fn refresh(&self) {
        if let Err(e) = self.cache.reload().await {
            log::error!("Error reloading leads: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn lead(name: &str, contact: &str) -> Lead {
        Lead {
            id: 1,
            lead_type: LeadType::Inbound,
            customer_name: name.to_string(),
            contact: contact.to_string(),
            fleet_size: Some(40),
            status: LeadStatus::New,
            created_at: None,
        }
    }

    #[test]
    fn test_email_contact_becomes_email() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let row = customer_from_lead(&lead("Jane Doe", "jane@x.com"), today, 30);
        assert_eq!(row.customer_email, "jane@x.com");
        assert_eq!(row.customer_mobile, "");
        assert_eq!(row.poc_type, PocType::FreePoc);
        assert_eq!(row.approval_status, ApprovalStatus::Pending);
        assert_eq!(row.poc_start_date, Some(today));
    }

    #[test]
    fn test_phone_contact_synthesises_email() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let row = customer_from_lead(&lead(" Blue  Fleet Co ", "+91 98765 43210"), today, 30);
        assert_eq!(row.customer_email, "blue.fleet.co@example.com");
        assert_eq!(row.customer_mobile, "+91 98765 43210");
        assert_eq!(row.lead_sources, vec!["lead_conversion".to_string()]);
    }

    #[test]
    fn test_status_labels_round_trip_through_serde() {
        let status: LeadStatus = serde_json::from_str("\"In Progress\"").unwrap();
        assert_eq!(status, LeadStatus::InProgress);
        assert!(LeadStatus::Converted.is_terminal());
        assert!(!LeadStatus::NotQualified.is_terminal());
    }
}
