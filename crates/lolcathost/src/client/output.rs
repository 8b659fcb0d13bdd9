//! Table and JSON rendering for list-style commands.

use super::OutputFormat;
use chrono::DateTime;
use lolcathost_common::protocol::{BackupInfo, HostEntry, PresetInfo};
use serde::Serialize;

/// Types renderable as aligned-column tables.
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

impl TableDisplay for HostEntry {
    fn headers() -> Vec<&'static str> {
        vec!["ALIAS", "DOMAIN", "IP", "GROUP", "ENABLED"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.alias.clone(),
            self.domain.clone(),
            self.ip.clone(),
            self.group.clone(),
            if self.enabled { "on" } else { "off" }.to_string(),
        ]
    }
}

impl TableDisplay for BackupInfo {
    fn headers() -> Vec<&'static str> {
        vec!["NAME", "CREATED", "SIZE"]
    }

    fn row(&self) -> Vec<String> {
        let created = DateTime::from_timestamp(self.timestamp, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        vec![self.name.clone(), created, format!("{} B", self.size)]
    }
}

impl TableDisplay for PresetInfo {
    fn headers() -> Vec<&'static str> {
        vec!["NAME", "ENABLE", "DISABLE"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.enable.join(","),
            self.disable.join(","),
        ]
    }
}

/// Prints items in the requested format.
pub fn print_items<T>(items: &[T], format: OutputFormat)
where
    T: TableDisplay + Serialize,
{
    match format {
        OutputFormat::Table => print_table(items),
        OutputFormat::Json => print_json(items),
    }
}

fn print_table<T: TableDisplay>(items: &[T]) {
    if items.is_empty() {
        return;
    }

    let headers = T::headers();
    let rows: Vec<Vec<String>> = items.iter().map(|i| i.row()).collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_line: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_line.join("  "));

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let width = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = width)
            })
            .collect();
        println!("{}", line.join("  "));
    }
}

fn print_json<T: Serialize>(items: &[T]) {
    match serde_json::to_string_pretty(items) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("Error serializing to JSON: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_entry_row() {
        let entry = HostEntry {
            domain: "myapp.local".to_string(),
            ip: "127.0.0.1".to_string(),
            alias: "myapp-local".to_string(),
            enabled: true,
            group: "dev".to_string(),
        };
        assert_eq!(
            entry.row(),
            vec!["myapp-local", "myapp.local", "127.0.0.1", "dev", "on"]
        );
    }

    #[test]
    fn backup_row_formats_timestamp() {
        let backup = BackupInfo {
            name: "hosts.20250101-120000.bak".to_string(),
            timestamp: 1_735_732_800,
            size: 321,
        };
        let row = backup.row();
        assert_eq!(row[0], "hosts.20250101-120000.bak");
        assert!(row[1].starts_with("2025-01-01"));
        assert_eq!(row[2], "321 B");
    }

    #[test]
    fn preset_row_joins_lists() {
        let preset = PresetInfo {
            name: "work".to_string(),
            enable: vec!["a".to_string(), "b".to_string()],
            disable: vec!["c".to_string()],
        };
        assert_eq!(preset.row(), vec!["work", "a,b", "c"]);
    }
}
