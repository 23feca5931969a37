//! Inward/outward ledger movements

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::Error;
use crate::inventory::{
    validate_imei, DeviceCondition, DeviceStatus, InwardDevice, InwardInsert, Inventory,
    OutwardDevice, OutwardInsert, StockDevice,
};
use crate::postgrest::tables;
use crate::Confirmation;

/// Manual inward entry
#[derive(Debug, Clone, PartialEq)]
pub struct NewInward {
    pub device_registration_number: String,
    pub device_imei: String,
    pub device_condition: DeviceCondition,
}

/// Manual outward entry
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutward {
    pub device_registration_number: String,
    pub device_imei: String,
    pub customer_id: i64,
    pub location: String,
    /// Defaults to today
    pub outward_date: Option<NaiveDate>,
    pub sim_no: Option<String>,
}

/// Where an inward device is being deployed
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub customer_id: i64,
    pub location: String,
    pub sim_no: Option<String>,
    /// Defaults to today
    pub outward_date: Option<NaiveDate>,
}

impl Assignment {
    pub fn new(customer_id: i64, location: &str) -> Self {
        Self {
            customer_id,
            location: location.to_string(),
            sim_no: None,
            outward_date: None,
        }
    }

    pub fn with_sim(mut self, sim_no: &str) -> Self {
        self.sim_no = Some(sim_no.to_string()).filter(|s| !s.trim().is_empty());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub inward: usize,
    pub outward: usize,
}

/// What a reconciliation pass repaired
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Registration numbers that were in both ledgers
    pub duplicates_resolved: Vec<String>,
    /// Available stock devices that were given back their inward row
    pub inward_restored: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.duplicates_resolved.is_empty() && self.inward_restored.is_empty()
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl Inventory {
    /// Stock row for a ledger entry, checking the IMEI against it
    pub(crate) async fn matching_stock(
        &self,
        registration: &str,
        imei: &str,
    ) -> Result<StockDevice, Error> {
        let stock = self
            .stock_by_registration(registration)
            .await?
            .ok_or_else(|| Error::not_found("Device not found in stock database"))?;
        if stock.device_imei != imei {
            return Err(Error::conflict("IMEI does not match stock database"));
        }
        Ok(stock)
    }

    /// Record a stock device as physically on hand
    pub async fn add_inward(&self, entry: NewInward) -> Result<InwardDevice, Error> {
        let inward = self.record_inward(&entry, "Manually added").await?;
        log::info!(
            "Device {} added to inward inventory",
            inward.device_registration_number
        );
        self.refresh().await;
        Ok(inward)
    }

    pub(crate) async fn record_inward(
        &self,
        entry: &NewInward,
        notes: &str,
    ) -> Result<InwardDevice, Error> {
        let registration = entry.device_registration_number.trim();
        let imei = entry.device_imei.trim();
        if registration.is_empty() || imei.is_empty() {
            return Err(Error::validation("Please fill in all required fields"));
        }
        validate_imei(imei)?;

        let stock = self.matching_stock(registration, imei).await?;
        if self.inward_by_registration(registration).await?.is_some() {
            return Err(Error::conflict("Device already exists in inward inventory"));
        }
        if self.outward_by_registration(registration).await?.is_some() {
            return Err(Error::conflict(
                "Device is deployed in outward inventory; return it instead",
            ));
        }

        let row = InwardInsert {
            device_registration_number: registration.to_string(),
            device_imei: imei.to_string(),
            device_condition: entry.device_condition,
            inward_date: Some(Utc::now().date_naive()),
            stock_id: Some(stock.id),
            processed_by: self.options.operator.clone(),
            notes: notes.to_string(),
        };
        self.table(tables::INWARD_DEVICES).insert(&row).await
    }

    /// Record a stock device as deployed without going through inward first
    pub async fn add_outward(&self, entry: NewOutward) -> Result<OutwardDevice, Error> {
        let registration = entry.device_registration_number.trim();
        let imei = entry.device_imei.trim();
        if registration.is_empty() || imei.is_empty() || entry.location.trim().is_empty() {
            return Err(Error::validation("Please fill in all required fields"));
        }
        validate_imei(imei)?;

        let stock = self.matching_stock(registration, imei).await?;
        let customer = self.approved_customer(entry.customer_id)?;
        if self.outward_by_registration(registration).await?.is_some() {
            return Err(Error::conflict("Device already exists in outward inventory"));
        }

        let row = OutwardInsert {
            device_registration_number: registration.to_string(),
            device_imei: imei.to_string(),
            customer_id: Some(customer.id),
            customer_name: customer.customer_name.clone(),
            location: entry.location.trim().to_string(),
            outward_date: Some(entry.outward_date.unwrap_or_else(|| Utc::now().date_naive())),
            sim_no: entry.sim_no.as_deref().and_then(non_empty),
            stock_id: Some(stock.id),
            processed_by: self.options.operator.clone(),
            notes: "Manually added".to_string(),
        };
        let outward = self.deploy(row).await?;
        log::info!(
            "Device {} added to outward inventory",
            outward.device_registration_number
        );
        self.refresh().await;
        Ok(outward)
    }

    /// Move an inward device to a customer
    pub async fn move_to_outward(
        &self,
        registration: &str,
        assignment: Assignment,
    ) -> Result<OutwardDevice, Error> {
        if assignment.location.trim().is_empty() {
            return Err(Error::validation("Please fill in customer and location"));
        }
        let inward = self
            .inward_by_registration(registration)
            .await?
            .ok_or_else(|| Error::not_found("Device not found in inward inventory"))?;
        let customer = self.approved_customer(assignment.customer_id)?;
        if self.outward_by_registration(registration).await?.is_some() {
            return Err(Error::conflict("Device already exists in outward inventory"));
        }

        let row = OutwardInsert {
            device_registration_number: inward.device_registration_number.clone(),
            device_imei: inward.device_imei.clone(),
            customer_id: Some(customer.id),
            customer_name: customer.customer_name.clone(),
            location: assignment.location.trim().to_string(),
            outward_date: Some(
                assignment
                    .outward_date
                    .unwrap_or_else(|| Utc::now().date_naive()),
            ),
            sim_no: assignment.sim_no.as_deref().and_then(non_empty),
            stock_id: inward.stock_id,
            processed_by: self.options.operator.clone(),
            notes: "Moved from inward".to_string(),
        };
        let outward = self.deploy(row).await?;
        log::info!(
            "Device {} moved to outward for {}",
            outward.device_registration_number,
            outward.customer_name
        );
        self.refresh().await;
        Ok(outward)
    }

    /// Insert the outward row, then drop the inward one; undo the insert if the delete fails
    pub(crate) async fn deploy(&self, row: OutwardInsert) -> Result<OutwardDevice, Error> {
        let registration = row.device_registration_number.clone();
        let outward: OutwardDevice = self.table(tables::OUTWARD_DEVICES).insert(&row).await?;

        let removed: Result<Vec<Value>, Error> = self
            .table(tables::INWARD_DEVICES)
            .eq("device_registration_number", &registration)
            .delete()
            .await;
        if let Err(e) = removed {
            return Err(self
                .undo_insert(tables::OUTWARD_DEVICES, outward.id, &registration, e)
                .await);
        }

        self.mark_stock(&registration, DeviceStatus::Assigned).await;
        Ok(outward)
    }

    /// Bring a deployed device back; its condition is recorded as used
    ///
    /// Returns `Ok(false)` without touching anything when the operator declines.
    pub async fn return_to_inward(
        &self,
        registration: &str,
        confirmation: Confirmation,
    ) -> Result<bool, Error> {
        if confirmation == Confirmation::Declined {
            return Ok(false);
        }
        let outward = self
            .outward_by_registration(registration)
            .await?
            .ok_or_else(|| Error::not_found("Device not found in outward inventory"))?;
        if self.inward_by_registration(registration).await?.is_some() {
            return Err(Error::conflict("Device already exists in inward inventory"));
        }

        let row = InwardInsert {
            device_registration_number: outward.device_registration_number.clone(),
            device_imei: outward.device_imei.clone(),
            device_condition: DeviceCondition::Used,
            inward_date: Some(Utc::now().date_naive()),
            stock_id: outward.stock_id,
            processed_by: self.options.operator.clone(),
            notes: "Returned from outward".to_string(),
        };
        let inward: InwardDevice = self.table(tables::INWARD_DEVICES).insert(&row).await?;

        let removed: Result<Vec<Value>, Error> = self
            .table(tables::OUTWARD_DEVICES)
            .eq("device_registration_number", registration)
            .delete()
            .await;
        if let Err(e) = removed {
            return Err(self
                .undo_insert(tables::INWARD_DEVICES, inward.id, registration, e)
                .await);
        }

        self.mark_stock(registration, DeviceStatus::Returned).await;
        log::info!("Device {} returned to inward", registration);
        self.refresh().await;
        Ok(true)
    }

    /// Repair ledger anomalies left behind by interrupted workflows
    ///
    /// A device in both ledgers keeps its newer entry (outward on ties). An
    /// available stock device in neither ledger gets its inward row back.
    pub async fn reconcile_ledgers(&self) -> Result<ReconcileReport, Error> {
        let inward: Vec<InwardDevice> = self.table(tables::INWARD_DEVICES).execute().await?;
        let outward: Vec<OutwardDevice> = self.table(tables::OUTWARD_DEVICES).execute().await?;
        let stock: Vec<StockDevice> = self.table(tables::STOCK).execute().await?;

        let mut report = ReconcileReport::default();
        let outward_by_reg: HashMap<&str, &OutwardDevice> = outward
            .iter()
            .map(|d| (d.device_registration_number.as_str(), d))
            .collect();

        for entry in &inward {
            let registration = entry.device_registration_number.as_str();
            let Some(deployed) = outward_by_reg.get(registration) else {
                continue;
            };
            let inward_is_newer = match (entry.created_at, deployed.created_at) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            };

            let removed: Result<Vec<Value>, Error> = if inward_is_newer {
                self.table(tables::OUTWARD_DEVICES)
                    .eq("id", deployed.id)
                    .delete()
                    .await
            } else {
                self.table(tables::INWARD_DEVICES)
                    .eq("id", entry.id)
                    .delete()
                    .await
            };
            match removed {
                Ok(_) => {
                    log::warn!(
                        "Device {} was in both ledgers, kept the {} entry",
                        registration,
                        if inward_is_newer { "inward" } else { "outward" }
                    );
                    report.duplicates_resolved.push(registration.to_string());
                }
                Err(e) => log::error!("Could not reconcile device {}: {}", registration, e),
            }
        }

        let listed: HashSet<&str> = inward
            .iter()
            .map(|d| d.device_registration_number.as_str())
            .chain(outward_by_reg.keys().copied())
            .collect();
        for device in stock
            .iter()
            .filter(|d| d.current_status == DeviceStatus::Available)
            .filter(|d| !listed.contains(d.device_registration_number.as_str()))
        {
            if self.auto_inward(device, "Restored by reconciliation").await {
                report
                    .inward_restored
                    .push(device.device_registration_number.clone());
            }
        }

        if !report.is_clean() {
            log::info!(
                "Ledger reconciliation: {} duplicates resolved, {} inward rows restored",
                report.duplicates_resolved.len(),
                report.inward_restored.len()
            );
            self.refresh().await;
        }
        Ok(report)
    }

    pub fn inventory_stats(&self) -> LedgerStats {
        LedgerStats {
            inward: self.inward.len(),
            outward: self.outward.len(),
        }
    }

    /// Search inward devices by registration, IMEI, condition or stock model
    pub fn search_inward(&self, query: &str) -> Vec<InwardDevice> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.inward.all();
        }
        let models: HashMap<i64, String> = self
            .stock
            .all()
            .into_iter()
            .map(|d| (d.id, d.device_model_no.to_lowercase()))
            .collect();

        self.inward.filter(|d| {
            let model = d.stock_id.and_then(|id| models.get(&id));
            d.device_registration_number.to_lowercase().contains(&query)
                || d.device_imei.to_lowercase().contains(&query)
                || d.device_condition.as_str().contains(&query)
                || d.device_condition.label().to_lowercase().contains(&query)
                || model.map(|m| m.contains(&query)).unwrap_or(false)
        })
    }

    /// Search outward devices by registration, IMEI, customer or location
    pub fn search_outward(&self, query: &str) -> Vec<OutwardDevice> {
        self.outward.search(query)
    }
}
