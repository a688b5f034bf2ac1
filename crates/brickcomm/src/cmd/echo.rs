use std::thread;
use std::time::{Duration, Instant};

use brickcomm_bt::{Connection, IoMode};
use serde::Serialize;
use tracing::{debug, info};

use crate::cmd::session::Session;
use crate::cmd::{parse_timeout, Context, EchoArgs};
use crate::exit::{bt_error, conn_error, CliError, CliResult, DATA_INVALID, SUCCESS, TIMEOUT, USAGE};
use crate::output::print_record;

const READ_POLL: Duration = Duration::from_millis(10);

#[derive(Serialize)]
struct EchoOutput {
    address: String,
    handle: u8,
    mode: &'static str,
    sent: String,
    received: String,
    matched: bool,
    round_trip_ms: f64,
}

pub fn run(args: EchoArgs, ctx: &Context) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    if args.text.is_empty() {
        return Err(CliError::new(USAGE, "text must not be empty"));
    }
    let (mode, mode_name) = if args.raw {
        (IoMode::Raw, "raw")
    } else {
        (IoMode::Packet, "packet")
    };

    let session = Session::open(ctx.config.as_deref())?;
    let conn = session
        .bt
        .connect(&args.target, mode, args.pin.as_deref())
        .map_err(|e| bt_error("connect failed", e))?;
    let address = conn.address().map(|a| a.to_string()).unwrap_or_default();
    info!(%address, handle = conn.handle(), "connected");

    let started = Instant::now();
    conn.write(args.text.as_bytes(), true)
        .map_err(|e| conn_error("write failed", e))?;
    let echoed = read_echo(&conn, args.text.len(), timeout)?;
    let elapsed = started.elapsed();

    let out = EchoOutput {
        address,
        handle: conn.handle(),
        mode: mode_name,
        sent: args.text.clone(),
        received: String::from_utf8_lossy(&echoed).into_owned(),
        matched: echoed == args.text.as_bytes(),
        round_trip_ms: (elapsed.as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
    };
    conn.close();
    drop(conn);

    let fields = [
        ("Remote", out.address.clone()),
        ("Handle", out.handle.to_string()),
        ("Mode", out.mode.to_string()),
        ("Sent", out.sent.clone()),
        ("Received", out.received.clone()),
        ("Round trip", format!("{:.2}ms", out.round_trip_ms)),
    ];
    print_record(&out, &fields, ctx.format);
    session.close()?;

    if !out.matched {
        return Err(CliError::new(DATA_INVALID, "echo did not match what was sent"));
    }
    Ok(SUCCESS)
}

/// Collect `len` bytes, giving up once `timeout` passes with nothing new.
fn read_echo(conn: &Connection, len: usize, timeout: Duration) -> CliResult<Vec<u8>> {
    let mut deadline = Instant::now() + timeout;
    let mut got = Vec::with_capacity(len);
    let mut buf = vec![0u8; len.max(64)];
    while got.len() < len {
        let n = conn
            .read(&mut buf, false)
            .map_err(|e| conn_error("read failed", e))?;
        if n == 0 {
            if Instant::now() >= deadline {
                return Err(CliError::new(
                    TIMEOUT,
                    format!("no echo after {timeout:?} ({} of {len} bytes)", got.len()),
                ));
            }
            thread::sleep(READ_POLL);
            continue;
        }
        debug!(bytes = n, "echo chunk");
        got.extend_from_slice(&buf[..n]);
        deadline = Instant::now() + timeout;
    }
    Ok(got)
}
