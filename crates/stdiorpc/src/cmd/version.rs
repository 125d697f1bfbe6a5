use stdiorpc::frame::{DEFAULT_MAX_HEADER, DEFAULT_MAX_PAYLOAD};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("stdiorpc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: stdiorpc");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "build_target: {}",
        option_env!("STDIORPC_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "features: conn={}, cli=true",
        cfg!(feature = "conn")
    );
    println!("max_payload_default: {DEFAULT_MAX_PAYLOAD}");
    println!("max_header_default: {DEFAULT_MAX_HEADER}");

    Ok(SUCCESS)
}
