use crate::query::commands::LedgerSummary;
use alloy_primitives::utils::format_units;
use alloy_primitives::{Address, U256};
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde_json::json;

const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

fn format_native(value: U256) -> String {
    format_units(value, 18).unwrap_or_else(|_| value.to_string())
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map_or(NOT_AVAILABLE.to_string(), |v| v.to_string())
}

/// Rows of `(metric, formatted, raw)`.
fn summary_rows(summary: &LedgerSummary) -> Vec<(&'static str, String, String)> {
    vec![
        (
            "Next Block",
            optional(summary.cursor),
            optional(summary.cursor),
        ),
        (
            "Refunded",
            optional(summary.refunded_wei.map(format_native)),
            optional(summary.refunded_wei),
        ),
        (
            "Refunded Addresses",
            optional(summary.refunded_count),
            optional(summary.refunded_count),
        ),
        (
            "Given Away",
            optional(summary.gave_wei.map(format_native)),
            optional(summary.gave_wei),
        ),
    ]
}

pub fn format_summary(summary: &LedgerSummary, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec!["Metric", "Value (Formatted)", "Raw"]);

            for (metric, formatted, raw) in summary_rows(summary) {
                table.add_row(vec![Cell::new(metric), Cell::new(formatted), Cell::new(raw)]);
            }
            table.to_string()
        }
        OutputFormat::Json => serde_json::to_string_pretty(&json!({
            "current_block_number": summary.cursor,
            "refunded": summary.refunded_wei.map(format_native),
            "refunded_wei": summary.refunded_wei.map(|v| v.to_string()),
            "refunded_addresses": summary.refunded_count,
            "gave": summary.gave_wei.map(format_native),
            "gave_wei": summary.gave_wei.map(|v| v.to_string()),
        }))
        .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["metric", "value_formatted", "raw"]);
            for (metric, formatted, raw) in summary_rows(summary) {
                let _ = wtr.write_record([metric, &formatted, &raw]);
            }
            String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
        }
    }
}

pub fn format_refunded(addresses: &[Address], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if addresses.is_empty() {
                return "No refunded addresses.".to_string();
            }
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec!["#", "Address"]);
            for (i, address) in addresses.iter().enumerate() {
                table.add_row(vec![Cell::new(i + 1), Cell::new(address.to_checksum(None))]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let list: Vec<String> = addresses.iter().map(|a| a.to_checksum(None)).collect();
            serde_json::to_string_pretty(&list).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["index", "address"]);
            for (i, address) in addresses.iter().enumerate() {
                let _ = wtr.write_record([(i + 1).to_string(), address.to_checksum(None)]);
            }
            String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
        }
    }
}
