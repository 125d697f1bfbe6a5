use serde_json::{json, Value};
use stdiorpc::conn::{Connection, InboundHandler, ResponseError};
use tokio_util::sync::CancellationToken;

use crate::cmd::EchoArgs;
use crate::exit::{rpc_error, CliResult, SUCCESS};

/// Answers every request with its own method and params.
struct EchoHandler;

impl InboundHandler for EchoHandler {
    fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, ResponseError> {
        tracing::info!(method, "echoing request");
        Ok(json!({ "method": method, "params": params }))
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        tracing::info!(method, params = ?params, "received notification");
    }
}

pub async fn run(args: EchoArgs) -> CliResult<i32> {
    let config = args.conn.connection_config(None)?;
    let (_conn, read_loop) = Connection::new(
        tokio::io::stdin(),
        tokio::io::stdout(),
        EchoHandler,
        config,
    );

    let ctx = CancellationToken::new();
    install_ctrlc_handler(ctx.clone());

    tracing::debug!("serving on stdio");
    read_loop
        .run(ctx)
        .await
        .map_err(|err| rpc_error("echo failed", err))?;

    Ok(SUCCESS)
}

fn install_ctrlc_handler(ctx: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupted, shutting down");
                ctx.cancel();
            }
            Err(err) => tracing::warn!(error = %err, "signal handler setup failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_echoed() {
        let result = EchoHandler
            .handle_request("textDocument/hover", Some(json!({"line": 3})))
            .unwrap();
        assert_eq!(
            result,
            json!({"method": "textDocument/hover", "params": {"line": 3}})
        );
    }

    #[test]
    fn missing_params_echo_as_null() {
        let result = EchoHandler.handle_request("shutdown", None).unwrap();
        assert_eq!(result, json!({"method": "shutdown", "params": null}));
    }
}
