use std::time::Instant;

use crate::cmd::child::ChildPeer;
use crate::cmd::{parse_duration, parse_params, CallArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_call_result, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = args.timeout.as_deref().map(parse_duration).transpose()?;
    let params = parse_params(args.params.as_deref())?;
    let config = args.conn.connection_config(timeout)?;

    let peer = ChildPeer::spawn(&args.program, config)?;

    let started = Instant::now();
    let outcome = peer.conn.call(&args.method, params, None).await;
    let elapsed = started.elapsed();
    peer.shutdown().await;

    let result = outcome.map_err(|err| rpc_error("call failed", err))?;
    tracing::info!(method = %args.method, elapsed_ms = elapsed.as_millis() as u64, "call completed");
    print_call_result(&args.method, &result, elapsed, format);

    Ok(SUCCESS)
}
