use std::io::{IsTerminal, Write};
use std::time::Duration;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
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

#[derive(Serialize)]
struct CallOutput<'a> {
    method: &'a str,
    result: &'a Value,
    elapsed_ms: u128,
}

#[derive(Serialize)]
struct NotifyOutput<'a> {
    method: &'a str,
    sent: bool,
}

pub fn print_call_result(method: &str, result: &Value, elapsed: Duration, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                method,
                result,
                elapsed_ms: elapsed.as_millis(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "ELAPSED", "RESULT"])
                .add_row(vec![
                    method.to_string(),
                    format!("{}ms", elapsed.as_millis()),
                    result_preview(result),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{}",
                serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
            );
        }
        OutputFormat::Raw => {
            print_raw(result.to_string().as_bytes());
        }
    }
}

pub fn print_notification_sent(method: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = NotifyOutput { method, sent: true };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["METHOD", "SENT"])
                .add_row(vec![method.to_string(), "yes".to_string()]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!("notification {method} sent"),
        OutputFormat::Raw => {}
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn result_preview(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
