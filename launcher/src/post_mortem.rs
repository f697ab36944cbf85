use std::{
    any::Any,
    env,
    fmt::Write as _,
    future::Future,
    io::{self, BufRead},
    panic::{self, AssertUnwindSafe},
};

use futures::FutureExt;
use log::{error, warn};

use crate::context::WorkerContext;

/// How a worker reacts to a failure escaping its entry point before re-raising it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostMortem {
    /// Re-raise right away.
    Off,
    /// Dump a diagnostic report to stderr, then re-raise.
    #[default]
    Report,
    /// Dump the report and hold the process until someone acknowledges it on stdin.
    Interactive,
}

impl PostMortem {
    /// The environment variable selecting the mode: `off`, `report` or `interactive`.
    pub const ENV: &str = "ORCHESTRA_POST_MORTEM";

    /// Reads the mode from `ORCHESTRA_POST_MORTEM`, falling back to `Report`.
    pub fn from_env() -> Self {
        match env::var(Self::ENV) {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                warn!("ignoring unknown {} value {value:?}", Self::ENV);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

impl std::str::FromStr for PostMortem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" | "false" => Ok(Self::Off),
            "report" | "1" | "true" => Ok(Self::Report),
            "interactive" => Ok(Self::Interactive),
            other => Err(format!("unknown post-mortem mode {other:?}")),
        }
    }
}

/// What escaped the entry point.
enum Failure<'a> {
    Error(&'a anyhow::Error),
    Panic(&'a (dyn Any + Send)),
}

/// Runs `entry` and, if it fails or panics, inspects the failure according to `mode`
/// before handing it back unchanged.
///
/// Panics are resumed after inspection, so the worker still unwinds with the original
/// payload.
pub async fn intercept<Fut, R>(ctx: &WorkerContext, mode: PostMortem, entry: Fut) -> anyhow::Result<R>
where
    Fut: Future<Output = anyhow::Result<R>>,
{
    match AssertUnwindSafe(entry).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            inspect(ctx, mode, Failure::Error(&e));
            Err(e)
        }
        Err(payload) => {
            inspect(ctx, mode, Failure::Panic(payload.as_ref()));
            panic::resume_unwind(payload)
        }
    }
}

fn inspect(ctx: &WorkerContext, mode: PostMortem, failure: Failure<'_>) {
    if mode == PostMortem::Off {
        return;
    }

    eprintln!("{}", report(ctx, &failure));

    if mode == PostMortem::Interactive {
        error!(rank = ctx.global_rank(); "worker halted for inspection, press enter to let it exit");

        let mut line = String::new();
        if let Err(e) = io::stdin().lock().read_line(&mut line) {
            warn!(rank = ctx.global_rank(); "could not wait on stdin: {e}");
        }
    }
}

fn report(ctx: &WorkerContext, failure: &Failure<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "==== post-mortem: worker {}/{} (local rank {}, machine {}, device {:?}) ====",
        ctx.global_rank(),
        ctx.world_size(),
        ctx.local_rank(),
        ctx.machine_rank(),
        ctx.device(),
    );

    match failure {
        Failure::Error(e) => {
            let _ = writeln!(out, "error: {e}");
            for cause in e.chain().skip(1) {
                let _ = writeln!(out, "  caused by: {cause}");
            }
            let _ = write!(out, "backtrace:\n{}", e.backtrace());
        }
        Failure::Panic(payload) => {
            let _ = write!(out, "panic: {}", panic_message(*payload));
        }
    }

    out
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "<non-string panic payload>"
    }
}
