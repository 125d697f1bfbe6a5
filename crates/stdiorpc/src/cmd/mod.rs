use std::time::Duration;

use clap::{Args, Subcommand};
use serde_json::Value;
use stdiorpc::conn::ConnectionConfig;
use stdiorpc::frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod child;
pub mod echo;
pub mod notify;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Spawn a program, send one request, and print the response.
    Call(CallArgs),
    /// Spawn a program and send one notification.
    Notify(NotifyArgs),
    /// Serve requests on this process's stdin/stdout, echoing them back.
    Echo(EchoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Call(args) => call::run(args, format).await,
        Command::Notify(args) => notify::run(args, format).await,
        Command::Echo(args) => echo::run(args).await,
        Command::Version(args) => version::run(args),
    }
}

/// Connection settings shared by every subcommand that opens one.
#[derive(Args, Debug, Clone)]
pub struct ConnArgs {
    /// Largest accepted or sent payload, in bytes.
    #[arg(long, value_name = "BYTES", env = "STDIORPC_MAX_PAYLOAD", default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,
}

impl ConnArgs {
    pub fn connection_config(&self, default_timeout: Option<Duration>) -> CliResult<ConnectionConfig> {
        if self.max_payload == 0 {
            return Err(CliError::new(USAGE, "--max-payload must be greater than zero"));
        }
        Ok(ConnectionConfig {
            frame: FrameConfig {
                max_payload_size: self.max_payload,
                ..FrameConfig::default()
            },
            default_timeout,
        })
    }
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Method name to call.
    pub method: String,
    /// Request params as JSON.
    #[arg(long, value_name = "JSON")]
    pub params: Option<String>,
    /// How long to wait for the response (e.g. 5s, 500ms). Default: forever.
    #[arg(long, env = "STDIORPC_TIMEOUT")]
    pub timeout: Option<String>,
    #[command(flatten)]
    pub conn: ConnArgs,
    /// Program to spawn, followed by its arguments.
    #[arg(last = true, required = true, value_name = "PROGRAM")]
    pub program: Vec<String>,
}

#[derive(Args, Debug)]
pub struct NotifyArgs {
    /// Method name to notify.
    pub method: String,
    /// Notification params as JSON.
    #[arg(long, value_name = "JSON")]
    pub params: Option<String>,
    #[command(flatten)]
    pub conn: ConnArgs,
    /// Program to spawn, followed by its arguments.
    #[arg(last = true, required = true, value_name = "PROGRAM")]
    pub program: Vec<String>,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_params(input: Option<&str>) -> CliResult<Option<Value>> {
    input
        .map(|text| {
            serde_json::from_str(text)
                .map_err(|err| CliError::new(USAGE, format!("invalid --params JSON: {err}")))
        })
        .transpose()
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
