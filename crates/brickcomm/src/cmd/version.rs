use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat};

#[derive(Serialize)]
struct VersionOutput {
    name: &'static str,
    version: &'static str,
    target: &'static str,
    profile: &'static str,
    target_os: &'static str,
    target_arch: &'static str,
    channels: usize,
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("brickcomm {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let out = VersionOutput {
        name: "brickcomm",
        version: env!("CARGO_PKG_VERSION"),
        target: option_env!("BRICKCOMM_BUILD_TARGET").unwrap_or("unknown"),
        profile: option_env!("BRICKCOMM_BUILD_PROFILE").unwrap_or("unknown"),
        target_os: std::env::consts::OS,
        target_arch: std::env::consts::ARCH,
        channels: brickcomm_bt::CHANNELS,
    };
    let fields = [
        ("Name", out.name.to_string()),
        ("Version", out.version.to_string()),
        ("Target", out.target.to_string()),
        ("Profile", out.profile.to_string()),
        ("OS", out.target_os.to_string()),
        ("Arch", out.target_arch.to_string()),
        ("Channels", out.channels.to_string()),
    ];
    print_record(&out, &fields, format);
    Ok(SUCCESS)
}
