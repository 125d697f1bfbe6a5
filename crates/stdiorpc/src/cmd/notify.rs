use crate::cmd::child::ChildPeer;
use crate::cmd::{parse_params, NotifyArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_notification_sent, OutputFormat};

pub async fn run(args: NotifyArgs, format: OutputFormat) -> CliResult<i32> {
    let params = parse_params(args.params.as_deref())?;
    let config = args.conn.connection_config(None)?;

    let peer = ChildPeer::spawn(&args.program, config)?;
    let outcome = peer.conn.notify(&args.method, params).await;
    peer.shutdown().await;

    outcome.map_err(|err| rpc_error("notify failed", err))?;
    print_notification_sent(&args.method, format);

    Ok(SUCCESS)
}
