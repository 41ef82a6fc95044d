//! luadbg Server
//!
//! Runs a Lua script under the debugger and exposes it as newline-delimited
//! JSON-RPC over stdin/stdout.
//!
//! ```text
//! luadbg-server [--config debugger.toml] [--stop-on-entry] script.lua
//! ```

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Sender};
use luadbg_core::{Debugger, DebuggerConfig, LuaHost};
use std::cell::RefCell;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use tracing::{debug, error, info};

mod handler;

use handler::{Command, Handler};

struct Args {
    script: PathBuf,
    config: Option<PathBuf>,
    stop_on_entry: bool,
}

fn parse_args() -> Result<Args> {
    let mut script = None;
    let mut config = None;
    let mut stop_on_entry = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a file argument")?;
                config = Some(PathBuf::from(path));
            }
            "--stop-on-entry" => stop_on_entry = true,
            flag if flag.starts_with("--") => bail!("unknown option: {}", flag),
            _ if script.is_none() => script = Some(PathBuf::from(arg)),
            _ => bail!("unexpected argument: {}", arg),
        }
    }

    let Some(script) = script else {
        bail!("usage: luadbg-server [--config FILE] [--stop-on-entry] SCRIPT");
    };
    Ok(Args {
        script,
        config,
        stop_on_entry,
    })
}

fn load_config(path: &Path) -> Result<DebuggerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = DebuggerConfig::from_toml_str(&text)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

/// Forwards stdin lines to the Lua thread.
fn spawn_reader(commands: Sender<Command>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    error!("Failed to read line: {}", e);
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            debug!("Received: {}", line);
            if commands.send(Command::parse(&line)).is_err() {
                break;
            }
        }
        debug!("stdin closed");
    })
}

fn main() -> Result<()> {
    // Initialize logging to stderr (stdout is for JSON-RPC)
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => DebuggerConfig::default(),
    };

    info!("luadbg-server starting for {}", args.script.display());

    let (tx, rx) = unbounded();
    let _reader = spawn_reader(tx);

    let host = LuaHost::new().context("Failed to create Lua state")?;
    let mut debugger = Debugger::with_config(config);
    unsafe { debugger.attach(host.as_ptr()) }.context("Failed to attach debugger")?;

    let handler = Rc::new(RefCell::new(Handler::new(rx, io::stdout())));
    let on_pause = handler.clone();
    debugger.set_pause_handler(move |session| on_pause.borrow_mut().on_pause(session));
    let on_tick = handler.clone();
    debugger.set_tick_handler(move |session| on_tick.borrow_mut().on_tick(session));

    if args.stop_on_entry {
        debugger.pause();
    }

    let error = match host.do_file(&args.script) {
        Ok(()) => None,
        Err(e) => {
            error!("Script failed: {}", e);
            Some(e.to_string())
        }
    };
    info!("Script finished");

    {
        let mut server = handler.borrow_mut();
        server.exited(error);
        server.serve(debugger.session_mut());
    }

    debugger.detach();
    info!("luadbg-server shutting down");
    Ok(())
}
