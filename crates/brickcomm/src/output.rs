use std::io::IsTerminal;

use brickcomm_bt::DeviceInfo;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Print a flat record. `fields` drive the table and pretty layouts; json
/// serializes `value` as is.
pub fn print_record<T: Serialize>(value: &T, fields: &[(&str, String)], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(value),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (label, text) in fields {
                table.add_row(vec![label.to_string(), text.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let width = fields.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
            for (label, text) in fields {
                println!("{label:<width$}  {text}");
            }
        }
    }
}

#[derive(Serialize)]
struct DeviceList<'a> {
    count: usize,
    devices: &'a [DeviceInfo],
}

pub fn print_devices(devices: &[DeviceInfo], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&DeviceList {
            count: devices.len(),
            devices,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ADDRESS", "NAME", "CLASS"]);
            for device in devices {
                table.add_row(vec![
                    device.address.to_string(),
                    display_name(&device.name).to_string(),
                    format!("{:#08x}", device.class),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            if devices.is_empty() {
                println!("no devices found");
            }
            for device in devices {
                println!(
                    "{}  {:<16}  class={:#08x}",
                    device.address,
                    display_name(&device.name),
                    device.class
                );
            }
        }
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() {
        "<unknown>"
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_names_are_marked() {
        assert_eq!(display_name(""), "<unknown>");
        assert_eq!(display_name("rover"), "rover");
    }

    #[test]
    fn device_list_serializes_addresses_as_text() {
        let devices = vec![DeviceInfo::new(
            brickcomm_bt::BtAddress([0x00, 0x16, 0x53, 0x0a, 0x0b, 0x0c]),
            "rover",
            0x0008_0804,
        )];
        let json = serde_json::to_value(DeviceList {
            count: devices.len(),
            devices: &devices,
        })
        .expect("device list should serialize");
        assert_eq!(json["count"], 1);
        assert_eq!(json["devices"][0]["address"], "00:16:53:0A:0B:0C");
        assert_eq!(json["devices"][0]["name"], "rover");
    }
}
