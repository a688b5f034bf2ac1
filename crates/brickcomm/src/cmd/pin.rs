use serde::Serialize;
use tracing::info;

use crate::cmd::session::{load_config, Session};
use crate::cmd::{Context, PinArgs};
use crate::exit::{bt_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::print_record;

#[derive(Serialize)]
struct PinOutput {
    pin: String,
    settings: Option<String>,
    changed: bool,
}

pub fn run(args: PinArgs, ctx: &Context) -> CliResult<i32> {
    if args.set.is_some() && load_config(ctx.config.as_deref())?.settings_path.is_none() {
        return Err(CliError::new(
            USAGE,
            "pin --set needs a settings_path in the --config file",
        ));
    }

    let session = Session::open(ctx.config.as_deref())?;
    let changed = match &args.set {
        Some(pin) => {
            session.bt.set_pin(pin).map_err(|e| bt_error("pin rejected", e))?;
            session
                .bt
                .save_settings()
                .map_err(|e| bt_error("settings save failed", e))?;
            info!("pin updated");
            true
        }
        None => false,
    };

    let out = PinOutput {
        pin: session.bt.pin(),
        settings: session
            .config
            .settings_path
            .as_ref()
            .map(|p| p.display().to_string()),
        changed,
    };
    let fields = [
        ("PIN", out.pin.clone()),
        (
            "Settings",
            out.settings.clone().unwrap_or_else(|| "<defaults>".to_string()),
        ),
        ("Changed", out.changed.to_string()),
    ];
    print_record(&out, &fields, ctx.format);
    session.close()?;
    Ok(SUCCESS)
}
