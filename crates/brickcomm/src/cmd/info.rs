use brickcomm_bt::DeviceInfo;
use serde::Serialize;

use crate::cmd::session::Session;
use crate::cmd::{Context, InfoArgs};
use crate::exit::{bt_error, CliResult, SUCCESS};
use crate::output::{print_devices, print_record, OutputFormat};

#[derive(Serialize)]
struct InfoOutput {
    address: String,
    name: String,
    version: String,
    visible: bool,
    operating_mode: u8,
    port_open: bool,
    reset_count: u32,
    connected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    known_devices: Option<Vec<DeviceInfo>>,
}

pub fn run(args: InfoArgs, ctx: &Context) -> CliResult<i32> {
    let session = Session::open(ctx.config.as_deref())?;
    let bt = &session.bt;

    let (major, minor) = bt.version().map_err(|e| bt_error("version query failed", e))?;
    let known_devices = if args.known {
        Some(bt.known_devices().map_err(|e| bt_error("known device list failed", e))?)
    } else {
        None
    };
    let out = InfoOutput {
        address: bt
            .local_address()
            .map_err(|e| bt_error("address query failed", e))?
            .to_string(),
        name: bt.friendly_name().map_err(|e| bt_error("name query failed", e))?,
        version: format!("{major}.{minor}"),
        visible: bt.visibility().map_err(|e| bt_error("visibility query failed", e))?,
        operating_mode: bt
            .operating_mode()
            .map_err(|e| bt_error("operating mode query failed", e))?,
        port_open: bt.port_open().map_err(|e| bt_error("port query failed", e))?,
        reset_count: bt.reset_count(),
        connected: bt.link_state().connected,
        known_devices,
    };

    print_info(&out, ctx.format);
    session.close()?;
    Ok(SUCCESS)
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    let fields = [
        ("Address", out.address.clone()),
        ("Name", out.name.clone()),
        ("Firmware", out.version.clone()),
        ("Visible", out.visible.to_string()),
        ("Operating mode", out.operating_mode.to_string()),
        ("Port open", out.port_open.to_string()),
        ("Resets", out.reset_count.to_string()),
        ("Connections", out.connected.to_string()),
    ];
    print_record(out, &fields, format);
    // Json carries the list inside the record.
    if let Some(devices) = out.known_devices.as_deref().filter(|_| !matches!(format, OutputFormat::Json)) {
        println!("Known devices:");
        print_devices(devices, format);
    }
}
