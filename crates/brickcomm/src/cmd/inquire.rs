use tracing::info;

use crate::cmd::session::Session;
use crate::cmd::{Context, InquireArgs};
use crate::exit::{bt_error, CliResult, SUCCESS};
use crate::output::print_devices;

pub fn run(args: InquireArgs, ctx: &Context) -> CliResult<i32> {
    let session = Session::open(ctx.config.as_deref())?;
    info!(max = args.max, units = args.units, class = args.class, "starting inquiry");

    let devices = session
        .bt
        .inquire(args.max, args.units, args.class)
        .map_err(|e| bt_error("inquiry failed", e))?;

    print_devices(&devices, ctx.format);
    session.close()?;
    Ok(SUCCESS)
}
