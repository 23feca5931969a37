//! Device inventory: the stock registry and the inward/outward ledgers
//!
//! Every device is registered once in `stock`. While it is physically on hand
//! it has a row in `inward_devices`; while deployed to a customer it has a row
//! in `outward_devices`, never both.

mod csv_io;
mod ledger;
mod stock;

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::cache::{Record, Searchable, TableCache};
use crate::config::DeskOptions;
use crate::customers::{ApprovalStatus, Customer};
use crate::error::Error;
use crate::postgrest::{null_as_default, tables, Gateway, TableQuery};

pub use csv_io::{ImportKind, ImportReport, StockExport};
pub use ledger::{Assignment, LedgerStats, NewInward, NewOutward, ReconcileReport};
pub use stock::{NewStockDevice, StockStats, StockUpdate};

static IMEI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{15}$").unwrap());

/// IMEIs are exactly fifteen digits
pub fn validate_imei(imei: &str) -> Result<(), Error> {
    if IMEI_RE.is_match(imei) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "Invalid IMEI format: \"{}\". Must be exactly 15 digits.",
            imei
        )))
    }
}

/// Lower-case and keep only letters and digits, so labels and column aliases compare equal
pub(crate) fn normalize_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Stock status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Available,
    Assigned,
    Maintenance,
    Defective,
    Returned,
}

const DEVICE_STATUSES: [(DeviceStatus, &str, &str); 5] = [
    (DeviceStatus::Available, "available", "Available"),
    (DeviceStatus::Assigned, "assigned", "Assigned"),
    (DeviceStatus::Maintenance, "maintenance", "Maintenance"),
    (DeviceStatus::Defective, "defective", "Defective"),
    (DeviceStatus::Returned, "returned", "Returned"),
];

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        DEVICE_STATUSES
            .iter()
            .find(|(status, _, _)| status == self)
            .map(|(_, value, _)| *value)
            .unwrap_or_default()
    }

    /// Display label
    pub fn label(&self) -> &'static str {
        DEVICE_STATUSES
            .iter()
            .find(|(status, _, _)| status == self)
            .map(|(_, _, label)| *label)
            .unwrap_or_default()
    }
}

impl FromStr for DeviceStatus {
    type Err = Error;

    /// Accepts the stored value or the display label, ignoring case and punctuation
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_label(s);
        DEVICE_STATUSES
            .iter()
            .find(|(_, value, label)| normalize_label(value) == wanted || normalize_label(label) == wanted)
            .map(|(status, _, _)| *status)
            .ok_or_else(|| Error::validation(format!("Unknown device status: \"{}\"", s)))
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical condition of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCondition {
    New,
    Good,
    LenseIssue,
    SimModuleFail,
    AutoRestart,
    DeviceTampered,
    Used,
    Refurbished,
    Damaged,
}

const DEVICE_CONDITIONS: [(DeviceCondition, &str, &str); 9] = [
    (DeviceCondition::New, "new", "New Device"),
    (DeviceCondition::Good, "good", "Good"),
    (DeviceCondition::LenseIssue, "lense_issue", "Lense Issue"),
    (DeviceCondition::SimModuleFail, "sim_module_fail", "SIM Module Fail"),
    (DeviceCondition::AutoRestart, "auto_restart", "Auto Restart"),
    (DeviceCondition::DeviceTampered, "device_tampered", "Device Tampered"),
    (DeviceCondition::Used, "used", "Used"),
    (DeviceCondition::Refurbished, "refurbished", "Refurbished"),
    (DeviceCondition::Damaged, "damaged", "Damaged"),
];

impl DeviceCondition {
    pub fn as_str(&self) -> &'static str {
        DEVICE_CONDITIONS
            .iter()
            .find(|(condition, _, _)| condition == self)
            .map(|(_, value, _)| *value)
            .unwrap_or_default()
    }

    /// Display label
    pub fn label(&self) -> &'static str {
        DEVICE_CONDITIONS
            .iter()
            .find(|(condition, _, _)| condition == self)
            .map(|(_, _, label)| *label)
            .unwrap_or_default()
    }
}

impl FromStr for DeviceCondition {
    type Err = Error;

    /// Accepts the stored value or the display label, ignoring case and punctuation
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_label(s);
        DEVICE_CONDITIONS
            .iter()
            .find(|(_, value, label)| normalize_label(value) == wanted || normalize_label(label) == wanted)
            .map(|(condition, _, _)| *condition)
            .ok_or_else(|| Error::validation(format!("Unknown device condition: \"{}\"", s)))
    }
}

impl fmt::Display for DeviceCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `stock` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockDevice {
    pub id: i64,
    pub sl_no: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub po_no: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub batch_no: String,
    pub inward_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub device_model_no: String,
    pub device_registration_number: String,
    pub device_imei: String,
    pub device_condition: DeviceCondition,
    pub current_status: DeviceStatus,
    pub inventory_status: Option<String>,
    pub imported_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Record for StockDevice {
    fn id(&self) -> i64 {
        self.id
    }
}

impl Searchable for StockDevice {
    fn search_fields(&self) -> Vec<String> {
        vec![
            self.device_model_no.clone(),
            self.device_registration_number.clone(),
            self.device_imei.clone(),
            self.po_no.clone(),
            self.batch_no.clone(),
            self.current_status.as_str().to_string(),
        ]
    }
}

/// A row of the `inward_devices` ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InwardDevice {
    pub id: i64,
    pub device_registration_number: String,
    pub device_imei: String,
    pub device_condition: DeviceCondition,
    pub inward_date: Option<NaiveDate>,
    pub stock_id: Option<i64>,
    pub processed_by: Option<String>,
    pub notes: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Record for InwardDevice {
    fn id(&self) -> i64 {
        self.id
    }
}

/// A row of the `outward_devices` ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutwardDevice {
    pub id: i64,
    pub device_registration_number: String,
    pub device_imei: String,
    pub customer_id: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub customer_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub location: String,
    pub outward_date: Option<NaiveDate>,
    pub sim_no: Option<String>,
    pub stock_id: Option<i64>,
    pub processed_by: Option<String>,
    pub notes: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Record for OutwardDevice {
    fn id(&self) -> i64 {
        self.id
    }
}

impl Searchable for OutwardDevice {
    fn search_fields(&self) -> Vec<String> {
        vec![
            self.device_registration_number.clone(),
            self.device_imei.clone(),
            self.customer_name.clone(),
            self.location.clone(),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct InwardInsert {
    pub device_registration_number: String,
    pub device_imei: String,
    pub device_condition: DeviceCondition,
    pub inward_date: Option<NaiveDate>,
    pub stock_id: Option<i64>,
    pub processed_by: String,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct OutwardInsert {
    pub device_registration_number: String,
    pub device_imei: String,
    pub customer_id: Option<i64>,
    pub customer_name: String,
    pub location: String,
    pub outward_date: Option<NaiveDate>,
    pub sim_no: Option<String>,
    pub stock_id: Option<i64>,
    pub processed_by: String,
    pub notes: String,
}

#[derive(Debug, Serialize)]
struct StockStatusPatch {
    current_status: DeviceStatus,
}

/// Stock registry and device ledgers
pub struct Inventory {
    gateway: Arc<dyn Gateway>,
    stock: Arc<TableCache<StockDevice>>,
    inward: Arc<TableCache<InwardDevice>>,
    outward: Arc<TableCache<OutwardDevice>>,
    customers: Arc<TableCache<Customer>>,
    options: DeskOptions,
}

impl Inventory {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        customers: Arc<TableCache<Customer>>,
        options: DeskOptions,
    ) -> Self {
        Self {
            stock: Arc::new(TableCache::new(gateway.clone(), tables::STOCK, "created_at")),
            inward: Arc::new(TableCache::new(
                gateway.clone(),
                tables::INWARD_DEVICES,
                "inward_date",
            )),
            outward: Arc::new(TableCache::new(
                gateway.clone(),
                tables::OUTWARD_DEVICES,
                "outward_date",
            )),
            gateway,
            customers,
            options,
        }
    }

    pub fn stock_cache(&self) -> &Arc<TableCache<StockDevice>> {
        &self.stock
    }

    pub fn inward_cache(&self) -> &Arc<TableCache<InwardDevice>> {
        &self.inward
    }

    pub fn outward_cache(&self) -> &Arc<TableCache<OutwardDevice>> {
        &self.outward
    }

    /// Reload stock and both ledgers
    pub async fn reload(&self) -> Result<(), Error> {
        self.stock.reload().await?;
        self.inward.reload().await?;
        self.outward.reload().await?;
        Ok(())
    }

    /// Reload after a write that already succeeded
    async fn refresh(&self) {
        if let Err(e) = self.reload().await {
            log::error!("Error reloading inventory: {}", e);
        }
    }

    fn table(&self, name: &str) -> TableQuery {
        TableQuery::new(self.gateway.clone(), name)
    }

    async fn stock_by_registration(&self, registration: &str) -> Result<Option<StockDevice>, Error> {
        self.table(tables::STOCK)
            .eq("device_registration_number", registration)
            .maybe_single()
            .await
    }

    async fn inward_by_registration(
        &self,
        registration: &str,
    ) -> Result<Option<InwardDevice>, Error> {
        self.table(tables::INWARD_DEVICES)
            .eq("device_registration_number", registration)
            .maybe_single()
            .await
    }

    async fn outward_by_registration(
        &self,
        registration: &str,
    ) -> Result<Option<OutwardDevice>, Error> {
        self.table(tables::OUTWARD_DEVICES)
            .eq("device_registration_number", registration)
            .maybe_single()
            .await
    }

    fn approved_customer(&self, id: i64) -> Result<Customer, Error> {
        self.customers
            .find(|c| c.id == id && c.approval_status == ApprovalStatus::Approved)
            .ok_or_else(|| Error::not_found("Customer not found"))
    }

    /// Approved customer with this name, ignoring case
    fn approved_customer_named(&self, name: &str) -> Option<Customer> {
        let name = name.trim().to_lowercase();
        self.customers.find(|c| {
            c.approval_status == ApprovalStatus::Approved
                && c.customer_name.trim().to_lowercase() == name
        })
    }

    /// Record the device's stock status; failures are only logged
    async fn mark_stock(&self, registration: &str, status: DeviceStatus) {
        let result: Result<Vec<Value>, Error> = self
            .table(tables::STOCK)
            .eq("device_registration_number", registration)
            .update(&StockStatusPatch {
                current_status: status,
            })
            .await;
        if let Err(e) = result {
            log::warn!(
                "Could not set stock status of {} to {}: {}",
                registration,
                status,
                e
            );
        }
    }

    /// Undo a ledger insert after the second step of a move failed
    ///
    /// Returns the original failure, or `Inconsistent` if the undo failed as well.
    async fn undo_insert(&self, table: &str, id: i64, registration: &str, cause: Error) -> Error {
        log::error!(
            "Moving {} failed half way, removing {} row {}: {}",
            registration,
            table,
            id,
            cause
        );
        let undone: Result<Vec<Value>, Error> = self.table(table).eq("id", id).delete().await;
        match undone {
            Ok(_) => cause,
            Err(undo) => Error::inconsistent(format!(
                "device {} is listed in both ledgers: {} (undo failed: {})",
                registration, cause, undo
            )),
        }
    }
}
