//! Stock registry operations

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::inventory::{
    validate_imei, DeviceCondition, DeviceStatus, InwardInsert, Inventory, StockDevice,
};
use crate::postgrest::tables;
use crate::Confirmation;

/// Form input for a device entering stock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewStockDevice {
    pub sl_no: Option<i64>,
    pub po_no: String,
    pub batch_no: String,
    pub inward_date: Option<NaiveDate>,
    pub device_model_no: String,
    pub device_registration_number: String,
    pub device_imei: String,
}

impl NewStockDevice {
    pub fn new(model: &str, registration: &str, imei: &str) -> Self {
        Self {
            device_model_no: model.to_string(),
            device_registration_number: registration.to_string(),
            device_imei: imei.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct StockInsert<'a> {
    sl_no: Option<i64>,
    po_no: &'a str,
    batch_no: &'a str,
    inward_date: Option<NaiveDate>,
    device_model_no: &'a str,
    device_registration_number: &'a str,
    device_imei: &'a str,
    device_condition: DeviceCondition,
    current_status: DeviceStatus,
    inventory_status: &'static str,
    imported_by: &'a str,
}

/// Editable stock fields; registration number and IMEI are fixed at creation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StockUpdate {
    pub sl_no: Option<i64>,
    pub po_no: String,
    pub batch_no: String,
    pub inward_date: Option<NaiveDate>,
    pub device_model_no: String,
    pub current_status: DeviceStatus,
}

impl From<&StockDevice> for StockUpdate {
    fn from(device: &StockDevice) -> Self {
        Self {
            sl_no: device.sl_no,
            po_no: device.po_no.clone(),
            batch_no: device.batch_no.clone(),
            inward_date: device.inward_date,
            device_model_no: device.device_model_no.clone(),
            current_status: device.current_status,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockStats {
    pub total: usize,
    pub available: usize,
    pub assigned: usize,
    pub returned: usize,
}

impl Inventory {
    /// Add a device to stock from the form; the inward date defaults to today
    pub async fn add_stock(&self, mut device: NewStockDevice) -> Result<StockDevice, Error> {
        if device.inward_date.is_none() {
            device.inward_date = Some(Utc::now().date_naive());
        }
        let stock = self.register_stock(&device).await?;
        log::info!("Stock device {} added", stock.device_registration_number);
        self.refresh().await;
        Ok(stock)
    }

    /// Validate, insert the stock row, then record the device as inward
    pub(crate) async fn register_stock(&self, device: &NewStockDevice) -> Result<StockDevice, Error> {
        let model = device.device_model_no.trim();
        let registration = device.device_registration_number.trim();
        let imei = device.device_imei.trim();

        if model.is_empty() || registration.is_empty() || imei.is_empty() {
            return Err(Error::validation("Please fill in all required fields"));
        }
        validate_imei(imei)?;

        if self.stock_by_registration(registration).await?.is_some() {
            return Err(Error::conflict(format!(
                "Device with registration number \"{}\" already exists",
                registration
            )));
        }
        let by_imei: Option<StockDevice> = self
            .table(tables::STOCK)
            .eq("device_imei", imei)
            .maybe_single()
            .await?;
        if by_imei.is_some() {
            return Err(Error::conflict(format!(
                "Device with IMEI \"{}\" already exists",
                imei
            )));
        }

        let row = StockInsert {
            sl_no: device.sl_no,
            po_no: device.po_no.trim(),
            batch_no: device.batch_no.trim(),
            inward_date: device.inward_date,
            device_model_no: model,
            device_registration_number: registration,
            device_imei: imei,
            device_condition: DeviceCondition::New,
            current_status: DeviceStatus::Available,
            inventory_status: "in_stock",
            imported_by: &self.options.operator,
        };
        let stock: StockDevice = self.table(tables::STOCK).insert(&row).await?;

        self.auto_inward(&stock, "Auto-added from stock").await;
        Ok(stock)
    }

    /// Create the inward row for a stock device; failures are logged, not returned
    pub(crate) async fn auto_inward(&self, stock: &StockDevice, notes: &str) -> bool {
        let row = InwardInsert {
            device_registration_number: stock.device_registration_number.clone(),
            device_imei: stock.device_imei.clone(),
            device_condition: stock.device_condition,
            inward_date: Some(stock.inward_date.unwrap_or_else(|| Utc::now().date_naive())),
            stock_id: Some(stock.id),
            processed_by: self.options.operator.clone(),
            notes: notes.to_string(),
        };
        let inserted: Result<Value, Error> =
            self.table(tables::INWARD_DEVICES).insert(&row).await;
        match inserted {
            Ok(_) => {
                log::debug!(
                    "Device {} added to inward inventory",
                    stock.device_registration_number
                );
                true
            }
            Err(e) => {
                log::error!(
                    "Error auto-adding {} to inward: {}",
                    stock.device_registration_number,
                    e
                );
                false
            }
        }
    }

    /// Edit the mutable stock fields
    pub async fn update_stock(&self, id: i64, update: StockUpdate) -> Result<StockDevice, Error> {
        if update.device_model_no.trim().is_empty() {
            return Err(Error::validation("Please fill in all required fields"));
        }
        let update = StockUpdate {
            po_no: update.po_no.trim().to_string(),
            batch_no: update.batch_no.trim().to_string(),
            device_model_no: update.device_model_no.trim().to_string(),
            ..update
        };

        let updated: Vec<StockDevice> = self
            .table(tables::STOCK)
            .eq("id", id)
            .update(&update)
            .await?;
        let device = updated
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("Device not found"))?;
        log::info!("Stock device {} updated", device.device_registration_number);
        self.refresh().await;
        Ok(device)
    }

    /// Remove a device that is not deployed, along with its inward row
    pub async fn delete_stock(&self, id: i64, confirmation: Confirmation) -> Result<bool, Error> {
        if confirmation == Confirmation::Declined {
            return Ok(false);
        }
        let device: StockDevice = self
            .table(tables::STOCK)
            .eq("id", id)
            .maybe_single()
            .await?
            .ok_or_else(|| Error::not_found("Device not found"))?;
        let registration = &device.device_registration_number;

        if self.outward_by_registration(registration).await?.is_some() {
            return Err(Error::conflict(format!(
                "Device \"{}\" is deployed to a customer; return it before deleting",
                registration
            )));
        }

        let _: Vec<Value> = self
            .table(tables::INWARD_DEVICES)
            .eq("device_registration_number", registration)
            .delete()
            .await?;
        let _: Vec<Value> = self.table(tables::STOCK).eq("id", id).delete().await?;

        log::info!("Stock device {} deleted", registration);
        self.refresh().await;
        Ok(true)
    }

    pub fn stock_stats(&self) -> StockStats {
        let devices = self.stock.all();
        let count = |status: DeviceStatus| devices.iter().filter(|d| d.current_status == status).count();
        StockStats {
            total: devices.len(),
            available: count(DeviceStatus::Available),
            assigned: count(DeviceStatus::Assigned),
            returned: count(DeviceStatus::Returned),
        }
    }

    /// Search stock by model, registration, IMEI, PO, batch or status
    pub fn search_stock(&self, query: &str) -> Vec<StockDevice> {
        self.stock.search(query)
    }
}
