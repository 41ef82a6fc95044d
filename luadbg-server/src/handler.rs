//! Request handler for luadbg-server
//!
//! Runs on the Lua thread. While the script is paused, [`Handler::on_pause`]
//! blocks on the command channel until a resuming request arrives; while it
//! runs, [`Handler::on_tick`] drains whatever is queued without blocking.

use anyhow::Result;
use crossbeam_channel::Receiver;
use luadbg_core::protocol::RpcMessage;
use luadbg_core::{DebugSession, EvalError, Event, Request, Response};
use serde::Serialize;
use std::io::Write;
use tracing::{debug, error, info};

/// One line read from stdin.
#[derive(Debug)]
pub struct Command {
    pub id: u64,
    pub request: Result<Request, String>,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        match serde_json::from_str::<RpcMessage<Request>>(line) {
            Ok(msg) => Command {
                id: msg.id.unwrap_or(0),
                request: Ok(msg.content),
            },
            Err(e) => Command {
                id: 0,
                request: Err(e.to_string()),
            },
        }
    }
}

pub struct Handler<W: Write> {
    commands: Receiver<Command>,
    out: W,
    shutdown: bool,
}

impl<W: Write> Handler<W> {
    pub fn new(commands: Receiver<Command>, out: W) -> Self {
        Self {
            commands,
            out,
            shutdown: false,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Announces the pause and serves requests until one resumes execution.
    pub fn on_pause(&mut self, session: &mut DebugSession) {
        let frame = session.get_call_stack().into_iter().next();
        let event = Event::Paused {
            file: frame.as_ref().map(|f| f.source.clone()).unwrap_or_default(),
            line: frame.as_ref().map_or(-1, |f| f.line),
            breakpoint: session.current_breakpoint().cloned(),
        };
        info!("Paused: {:?}", event);
        self.send(&RpcMessage::notification(event));

        loop {
            let Ok(command) = self.commands.recv() else {
                info!("Command channel closed, letting the script run to completion");
                release(session);
                return;
            };
            if self.dispatch(session, command) {
                return;
            }
        }
    }

    /// Serves queued requests while the script is running.
    pub fn on_tick(&mut self, session: &mut DebugSession) {
        while let Ok(command) = self.commands.try_recv() {
            self.dispatch(session, command);
        }
    }

    /// Sends the exit notification for the finished script.
    pub fn exited(&mut self, error: Option<String>) {
        self.send(&RpcMessage::notification(Event::Exited { error }));
    }

    /// Serves requests after the script finished, until shutdown or EOF.
    pub fn serve(&mut self, session: &mut DebugSession) {
        while !self.shutdown {
            let Ok(command) = self.commands.recv() else {
                break;
            };
            self.dispatch(session, command);
        }
    }

    /// Handles one command and replies. Returns whether it resumes a pause.
    fn dispatch(&mut self, session: &mut DebugSession, command: Command) -> bool {
        let (response, resumes) = match &command.request {
            Ok(request) => (self.handle(session, request), request.resumes()),
            Err(e) => (Response::error(format!("Parse error: {}", e)), false),
        };
        self.send(&RpcMessage::new(command.id, response));
        resumes
    }

    pub fn handle(&mut self, session: &mut DebugSession, request: &Request) -> Response {
        debug!("Handling {:?}", request);
        match request {
            Request::AddBreakpoint { file, line } => Response::Breakpoint {
                breakpoint: session.add_breakpoint(file, *line).clone(),
            },
            Request::RemoveBreakpoint { file, line } => {
                found(session.remove_breakpoint(file, *line))
            }
            Request::EnableBreakpoint { file, line } => {
                found(session.enable_breakpoint(file, *line))
            }
            Request::DisableBreakpoint { file, line } => {
                found(session.disable_breakpoint(file, *line))
            }
            Request::ListBreakpoints => Response::Breakpoints {
                breakpoints: session.breakpoints().iter().cloned().collect(),
            },
            Request::Continue => {
                session.continue_running();
                Response::success()
            }
            Request::StepIn => {
                session.step_in();
                Response::success()
            }
            Request::StepOver => {
                session.step_over();
                Response::success()
            }
            Request::StepOut => {
                session.step_out();
                Response::success()
            }
            Request::Pause => {
                session.pause();
                Response::success()
            }
            Request::GetCallStack => {
                if !session.is_paused() {
                    return not_paused();
                }
                Response::CallStack {
                    frames: session.get_call_stack(),
                }
            }
            Request::GetLocalVars { level } => match session.current_debug_info() {
                Some(info) => Response::variables(info.get_local_vars(*level)),
                None => not_paused(),
            },
            Request::SetLocalVar { level, name, value } => match session.current_debug_info() {
                Some(info) => found(info.set_local_var_at(*level, name, value)),
                None => not_paused(),
            },
            Request::Eval { level, expr } => match session.current_debug_info() {
                Some(info) => match info.eval_at(*level, expr) {
                    Ok(values) => Response::eval_result(values),
                    Err(e) => Response::error(e.to_string()),
                },
                None => not_paused(),
            },
            Request::Shutdown => {
                info!("Shutdown requested");
                self.shutdown = true;
                session.clear_breakpoints();
                release(session);
                Response::success()
            }
        }
    }

    fn send<T: Serialize>(&mut self, msg: &T) {
        if let Err(e) = self.write(msg) {
            error!("Failed to send message: {}", e);
        }
    }

    fn write<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        debug!("Sending: {}", json);
        writeln!(self.out, "{}", json)?;
        self.out.flush()?;
        Ok(())
    }
}

fn found(ok: bool) -> Response {
    if ok {
        Response::success()
    } else {
        Response::not_found()
    }
}

/// Stops all further pauses and ticks.
fn release(session: &mut DebugSession) {
    session.continue_running();
    session.clear_pause_handler();
    session.clear_tick_handler();
}

fn not_paused() -> Response {
    Response::error(EvalError::NotPaused.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use luadbg_core::{Debugger, LuaHost};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn output_lines(handler: &Handler<Vec<u8>>) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(handler.output())
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_command_parse() {
        let command = Command::parse(r#"{"jsonrpc":"2.0","id":5,"method":"continue"}"#);
        assert_eq!(command.id, 5);
        assert_eq!(command.request, Ok(Request::Continue));

        let command = Command::parse("not json");
        assert_eq!(command.id, 0);
        assert!(command.request.is_err());
    }

    #[test]
    fn test_pause_serves_until_resume() {
        let (tx, rx) = unbounded();
        for line in [
            r#"{"jsonrpc":"2.0","id":1,"method":"get_local_vars","params":{"level":0}}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"eval","params":{"expr":"a + 1"}}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"continue"}"#,
        ] {
            tx.send(Command::parse(line)).unwrap();
        }

        let host = LuaHost::new().unwrap();
        let mut debugger = Debugger::new();
        unsafe { debugger.attach(host.as_ptr()).unwrap() };
        debugger.add_breakpoint("t.lua", 2);

        let handler = Rc::new(RefCell::new(Handler::new(rx, Vec::new())));
        let h = handler.clone();
        debugger.set_pause_handler(move |session| h.borrow_mut().on_pause(session));

        host.do_string("local a = 1\nlocal b = a + 1\nresult = b", "t.lua")
            .unwrap();

        let lines = output_lines(&handler.borrow());
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["event"], "paused");
        assert_eq!(lines[0]["body"]["file"], "t.lua");
        assert_eq!(lines[0]["body"]["line"], 2);
        assert_eq!(lines[0]["body"]["breakpoint"]["hit_count"], 1);
        assert_eq!(lines[1]["id"], 1);
        assert_eq!(lines[1]["variables"][0]["name"], "a");
        assert_eq!(lines[1]["variables"][0]["value"], 1.0);
        assert_eq!(lines[2]["values"][0], 2.0);
        assert_eq!(lines[3]["ok"], true);
    }

    #[test]
    fn test_requests_outside_pause() {
        let (tx, rx) = unbounded();
        for line in [
            r#"{"jsonrpc":"2.0","id":1,"method":"add_breakpoint","params":{"file":"a.lua","line":3}}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"get_call_stack"}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"disable_breakpoint","params":{"file":"b.lua","line":3}}"#,
            "garbage",
            r#"{"jsonrpc":"2.0","id":4,"method":"shutdown"}"#,
            r#"{"jsonrpc":"2.0","id":5,"method":"list_breakpoints"}"#,
        ] {
            tx.send(Command::parse(line)).unwrap();
        }

        let mut debugger = Debugger::new();
        let mut handler = Handler::new(rx, Vec::new());
        handler.serve(debugger.session_mut());
        assert!(handler.is_shutdown());

        let lines = output_lines(&handler);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["breakpoint"]["file"], "a.lua");
        assert_eq!(lines[1]["error"], "No paused frame to evaluate in");
        assert_eq!(lines[2]["ok"], false);
        assert!(lines[3]["error"].as_str().unwrap().starts_with("Parse error"));
        assert_eq!(lines[4]["ok"], true);
        assert!(debugger.breakpoints().is_empty());
    }
}
