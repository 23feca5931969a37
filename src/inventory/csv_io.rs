//! CSV bulk import and stock export

use chrono::{NaiveDate, Utc};
use csv::{QuoteStyle, ReaderBuilder, Terminator, Trim, WriterBuilder};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::error::Error;
use crate::inventory::{
    normalize_label, validate_imei, DeviceCondition, Inventory, NewInward, NewStockDevice,
    OutwardInsert,
};
use crate::postgrest::tables;

const STOCK_EXPORT_HEADERS: [&str; 10] = [
    "Sl. No.",
    "PO No",
    "Batch No.",
    "Inward Date",
    "Device Model No.",
    "Device Registration Number",
    "Device IMEI",
    "Current Status",
    "Device Condition",
    "Created At",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    Stock,
    Inward,
    Outward,
}

impl fmt::Display for ImportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportKind::Stock => "stock",
            ImportKind::Inward => "inward",
            ImportKind::Outward => "outward",
        })
    }
}

/// Outcome of a bulk import; rows are applied independently
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// `Row N: message` for every rejected row, N counting data rows from 1
    pub errors: Vec<String>,
}

impl ImportReport {
    fn record(&mut self, row: usize, outcome: Result<(), Error>) {
        match outcome {
            Ok(()) => self.successful += 1,
            Err(e) => {
                self.failed += 1;
                self.errors.push(format!("Row {}: {}", row, e));
            }
        }
    }
}

/// Rendered stock export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockExport {
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ImportLogInsert<'a> {
    filename: &'a str,
    import_type: ImportKind,
    total_rows: usize,
    successful_imports: usize,
    failed_imports: usize,
    error_details: &'a [String],
    imported_by: &'a str,
}

/// One data row keyed by normalised header
struct CsvRow {
    fields: HashMap<String, String>,
}

impl CsvRow {
    /// First non-empty value among the given column names
    fn get(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.fields.get(&normalize_label(name)))
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
    }
}

fn read_rows(data: &str) -> Result<Vec<CsvRow>, Error> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(data.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(normalize_label).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        let fields = headers
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect();
        rows.push(CsvRow { fields });
    }

    if headers.iter().all(String::is_empty) || rows.is_empty() {
        return Err(Error::validation("CSV file is empty or invalid"));
    }
    Ok(rows)
}

fn parse_date(value: &str) -> Result<NaiveDate, Error> {
    ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        .ok_or_else(|| Error::validation(format!("Invalid date: \"{}\"", value)))
}

impl Inventory {
    /// Import stock rows (`Sl. No., PO No, Batch No., Inward Date, Device Model No.,
    /// Device Registration Number, Device IMEI`)
    pub async fn import_stock_csv(&self, filename: &str, data: &str) -> Result<ImportReport, Error> {
        let rows = read_rows(data)?;
        let mut report = ImportReport {
            total: rows.len(),
            ..ImportReport::default()
        };

        for (index, row) in rows.iter().enumerate() {
            let outcome = self.import_stock_row(row).await;
            report.record(index + 1, outcome);
        }

        self.finish_import(ImportKind::Stock, filename, &report).await;
        Ok(report)
    }

    async fn import_stock_row(&self, row: &CsvRow) -> Result<(), Error> {
        let model = row.get(&["Device Model No."]);
        let registration = row.get(&["Device Registration Number"]);
        let imei = row.get(&["Device IMEI"]);
        let (Some(model), Some(registration), Some(imei)) = (model, registration, imei) else {
            return Err(Error::validation(
                "Missing required fields: Device Model No., Device Registration Number, and Device IMEI",
            ));
        };
        validate_imei(imei)?;

        let inward_date = row.get(&["Inward Date"]).map(parse_date).transpose()?;
        let device = NewStockDevice {
            sl_no: row.get(&["Sl. No."]).and_then(|v| v.parse().ok()),
            po_no: row.get(&["PO No"]).unwrap_or_default().to_string(),
            batch_no: row.get(&["Batch No."]).unwrap_or_default().to_string(),
            inward_date,
            ..NewStockDevice::new(model, registration, imei)
        };
        self.register_stock(&device).await.map(|_| ())
    }

    /// Import inward rows (`Device Registration Number, Device IMEI, Device Condition`)
    pub async fn import_inward_csv(&self, filename: &str, data: &str) -> Result<ImportReport, Error> {
        let rows = read_rows(data)?;
        let mut report = ImportReport {
            total: rows.len(),
            ..ImportReport::default()
        };

        for (index, row) in rows.iter().enumerate() {
            let outcome = self.import_inward_row(row).await;
            report.record(index + 1, outcome);
        }

        self.finish_import(ImportKind::Inward, filename, &report).await;
        Ok(report)
    }

    async fn import_inward_row(&self, row: &CsvRow) -> Result<(), Error> {
        let condition = match row.get(&["Device Condition"]) {
            Some(value) => value.parse()?,
            None => DeviceCondition::New,
        };
        let entry = NewInward {
            device_registration_number: row
                .get(&["Device Registration Number"])
                .unwrap_or_default()
                .to_string(),
            device_imei: row.get(&["Device IMEI"]).unwrap_or_default().to_string(),
            device_condition: condition,
        };
        self.record_inward(&entry, "Imported from CSV").await.map(|_| ())
    }

    /// Import outward rows (`Device Registration Number, Device IMEI, Customer Name,
    /// Location, Date, SIM No`)
    pub async fn import_outward_csv(
        &self,
        filename: &str,
        data: &str,
    ) -> Result<ImportReport, Error> {
        let rows = read_rows(data)?;
        let mut report = ImportReport {
            total: rows.len(),
            ..ImportReport::default()
        };

        for (index, row) in rows.iter().enumerate() {
            let outcome = self.import_outward_row(row).await;
            report.record(index + 1, outcome);
        }

        self.finish_import(ImportKind::Outward, filename, &report).await;
        Ok(report)
    }

    async fn import_outward_row(&self, row: &CsvRow) -> Result<(), Error> {
        let registration = row.get(&["Device Registration Number"]);
        let imei = row.get(&["Device IMEI"]);
        let customer_name = row.get(&["Customer Name"]);
        let location = row.get(&["Location"]);
        let (Some(registration), Some(imei), Some(customer_name), Some(location)) =
            (registration, imei, customer_name, location)
        else {
            return Err(Error::validation(
                "Missing required fields: Device Registration Number, Device IMEI, Customer Name, and Location",
            ));
        };
        validate_imei(imei)?;

        let stock = self.matching_stock(registration, imei).await?;
        if self.outward_by_registration(registration).await?.is_some() {
            return Err(Error::conflict("Device already exists in outward inventory"));
        }

        let customer = self.approved_customer_named(customer_name);
        if customer.is_none() {
            log::warn!(
                "Outward import: no approved customer named \"{}\"",
                customer_name
            );
        }
        let outward_date = match row.get(&["Date", "outward_date"]) {
            Some(value) => parse_date(value)?,
            None => Utc::now().date_naive(),
        };

        let insert = OutwardInsert {
            device_registration_number: registration.to_string(),
            device_imei: imei.to_string(),
            customer_id: customer.as_ref().map(|c| c.id),
            customer_name: customer
                .map(|c| c.customer_name)
                .unwrap_or_else(|| customer_name.to_string()),
            location: location.to_string(),
            outward_date: Some(outward_date),
            sim_no: row.get(&["SIM No"]).map(str::to_string),
            stock_id: Some(stock.id),
            processed_by: self.options.operator.clone(),
            notes: "Imported from CSV".to_string(),
        };
        self.deploy(insert).await.map(|_| ())
    }

    /// Log the import and reload; neither failure affects the report
    async fn finish_import(&self, kind: ImportKind, filename: &str, report: &ImportReport) {
        log::info!(
            "{} import of {}: {} rows, {} successful, {} failed",
            kind,
            filename,
            report.total,
            report.successful,
            report.failed
        );

        let row = ImportLogInsert {
            filename,
            import_type: kind,
            total_rows: report.total,
            successful_imports: report.successful,
            failed_imports: report.failed,
            error_details: &report.errors,
            imported_by: &self.options.operator,
        };
        let logged: Result<Value, Error> = self.table(tables::CSV_IMPORT_LOGS).insert(&row).await;
        if let Err(e) = logged {
            log::error!("Error logging CSV import: {}", e);
        }

        self.refresh().await;
    }

    /// Render the cached stock set as CSV
    pub fn export_stock_csv(&self, today: NaiveDate) -> Result<StockExport, Error> {
        let devices = self.stock.all();
        if devices.is_empty() {
            return Err(Error::validation("No stock data to export"));
        }

        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::Always)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer.write_record(STOCK_EXPORT_HEADERS)?;

        for device in &devices {
            writer.write_record([
                device.sl_no.map(|n| n.to_string()).unwrap_or_default(),
                device.po_no.clone(),
                device.batch_no.clone(),
                device.inward_date.map(|d| d.to_string()).unwrap_or_default(),
                device.device_model_no.clone(),
                device.device_registration_number.clone(),
                device.device_imei.clone(),
                device.current_status.as_str().to_string(),
                device.device_condition.as_str().to_string(),
                device
                    .created_at
                    .map(|t| t.date_naive().to_string())
                    .unwrap_or_default(),
            ])?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| Error::general(format!("Error exporting data: {}", e)))?;
        let content = String::from_utf8(bytes)
            .map_err(|e| Error::general(format!("Error exporting data: {}", e)))?;

        Ok(StockExport {
            filename: format!("stock_export_{}.csv", today.format("%Y-%m-%d")),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_match_labels_and_aliases() {
        let rows = read_rows(
            "device_registration_number,Device IMEI,DEVICE CONDITION\n\
             REG-1,356938035643809,Good\n\
             ,,\n",
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(&["Device Registration Number"]), Some("REG-1"));
        assert_eq!(rows[0].get(&["device_imei"]), Some("356938035643809"));
        assert_eq!(rows[0].get(&["Device Condition"]), Some("Good"));
    }

    #[test]
    fn test_quoted_fields_and_short_rows() {
        let rows = read_rows(
            "Device Registration Number,Location,SIM No\n\"REG-9\",\"Pune, MH\"\n",
        )
        .unwrap();
        assert_eq!(rows[0].get(&["Location"]), Some("Pune, MH"));
        assert_eq!(rows[0].get(&["SIM No"]), None);
    }

    #[test]
    fn test_empty_file_is_rejected() {
        assert!(matches!(read_rows(""), Err(Error::Validation(_))));
        assert!(matches!(
            read_rows("Device IMEI\n"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(parse_date("2024-03-09").unwrap(), expected);
        assert_eq!(parse_date("09/03/2024").unwrap(), expected);
        assert!(parse_date("March 9").is_err());
    }

    #[test]
    fn test_report_formats_row_errors() {
        let mut report = ImportReport::default();
        report.record(1, Ok(()));
        report.record(2, Err(Error::conflict("Device already exists in inward inventory")));
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(
            report.errors,
            vec!["Row 2: Device already exists in inward inventory".to_string()]
        );
    }
}
