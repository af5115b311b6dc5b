use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::lang::value::{Module, Value};
use crate::modules::{arg_int, expect_args, native};

/// Granularity at which `sleep` checks for cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Longest accepted `sleep`, one year.
const MAX_SLEEP_MS: i64 = 365 * 24 * 60 * 60 * 1000;

fn since_epoch() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

pub fn module() -> Module {
    Module::from_builtins(
        "time",
        vec![
            native("now", |_, args| {
                expect_args("now", args, 0)?;
                Ok(Value::Float(since_epoch().as_secs_f64()))
            }),
            native("unix", |_, args| {
                expect_args("unix", args, 0)?;
                Ok(Value::Int(since_epoch().as_secs() as i64))
            }),
            native("sleep", |ctx, args| {
                expect_args("sleep", args, 1)?;
                let ms = arg_int("sleep", &args[0])?;
                if ms < 0 {
                    return Err(Value::runtime_error("sleep() duration must not be negative"));
                }
                let deadline = Some(ms)
                    .filter(|ms| *ms <= MAX_SLEEP_MS)
                    .and_then(|ms| Instant::now().checked_add(Duration::from_millis(ms as u64)));
                let Some(deadline) = deadline else {
                    return Ok(Value::external_err(format!("sleep duration too large ({} ms)", ms)));
                };
                loop {
                    if ctx.is_cancelled() {
                        debug!(ms, "sleep cancelled");
                        return Ok(Value::external_err("sleep cancelled"));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Value::ok(Value::Nil));
                    }
                    std::thread::sleep(SLEEP_SLICE.min(deadline - now));
                }
            }),
        ],
    )
}
