//! The debugger command surface.
//!
//! Commands arrive as text lines over an abstract channel (a pair of
//! pipes in a real deployment, an in-memory queue in tests). Responses
//! are prefixed `data.<cmd>:`, or `data.<cmd>.error:` on failure. Scope
//! and job identities cross this boundary as opaque ids only.

use std::collections::VecDeque;

use parking_lot::Mutex;

use svi_core::parser;

use crate::error::VmResult;
use crate::machine::VirtualMachine;

/// A parsed debugger command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugCommand {
    Ping,
    Step,
    Run,
    Peek,
    Lookup(String),
    State,
    Exit,
}

impl DebugCommand {
    /// Parse a command line; unknown lines yield `None`.
    pub fn parse(line: &str) -> Option<DebugCommand> {
        let mut parts = line.split_whitespace();
        let command = match parts.next()? {
            "PING" => DebugCommand::Ping,
            "STEP" => DebugCommand::Step,
            "RUN" => DebugCommand::Run,
            "PEEK" => DebugCommand::Peek,
            "LOOKUP" => DebugCommand::Lookup(parts.next()?.to_string()),
            "STATE" => DebugCommand::State,
            "EXIT" => DebugCommand::Exit,
            _ => return None,
        };
        Some(command)
    }

    fn keyword(&self) -> &'static str {
        match self {
            DebugCommand::Ping => "ping",
            DebugCommand::Step => "step",
            DebugCommand::Run => "run",
            DebugCommand::Peek => "peek",
            DebugCommand::Lookup(_) => "lookup",
            DebugCommand::State => "state",
            DebugCommand::Exit => "exit",
        }
    }
}

/// The transport the debugger speaks over.
pub trait DebugChannel {
    /// The next command line, or `None` when the peer went away.
    fn receive(&mut self) -> Option<String>;

    /// Send one response line.
    fn send(&mut self, line: &str);
}

/// An in-memory channel for embedding and tests.
#[derive(Default)]
pub struct LoopbackChannel {
    commands: Mutex<VecDeque<String>>,
    responses: Mutex<Vec<String>>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_command(&self, line: impl Into<String>) {
        self.commands.lock().push_back(line.into());
    }

    pub fn responses(&self) -> Vec<String> {
        self.responses.lock().clone()
    }
}

impl DebugChannel for &LoopbackChannel {
    fn receive(&mut self) -> Option<String> {
        self.commands.lock().pop_front()
    }

    fn send(&mut self, line: &str) {
        self.responses.lock().push(line.to_string());
    }
}

/// Drives a machine step-wise from a command channel.
pub struct Debugger {
    vm: VirtualMachine,
}

impl Debugger {
    pub fn new(vm: VirtualMachine) -> Self {
        Self { vm }
    }

    pub fn into_machine(self) -> VirtualMachine {
        self.vm
    }

    /// Serve commands until `EXIT` or the channel closes.
    pub fn serve<C: DebugChannel>(&mut self, mut channel: C) {
        while let Some(line) = channel.receive() {
            let Some(command) = DebugCommand::parse(&line) else {
                channel.send(&format!("data.unknown.error:unrecognized command `{line}`"));
                continue;
            };

            if command == DebugCommand::Exit {
                channel.send("data.exit:bye");
                return;
            }

            match self.handle(&command) {
                Ok(response) => {
                    channel.send(&format!("data.{}:{response}", command.keyword()));
                }
                Err(err) => {
                    channel.send(&format!("data.{}.error:{err}", command.keyword()));
                }
            }
        }
    }

    fn handle(&mut self, command: &DebugCommand) -> VmResult<String> {
        match command {
            DebugCommand::Ping => Ok("pong".to_string()),
            DebugCommand::Step => {
                self.vm.step()?;
                Ok(format!("pc={}", self.vm.state()?.pc()))
            }
            DebugCommand::Run => {
                self.vm.execute()?;
                Ok("complete".to_string())
            }
            DebugCommand::Peek => {
                let state = self.vm.state()?;
                match state.current() {
                    Some(instruction) => Ok(format!("pc={} {instruction}", state.pc())),
                    None => Ok("end-of-program".to_string()),
                }
            }
            DebugCommand::Lookup(token) => {
                let location = parser::parse_location(token)?;
                let value = self.vm.load_from_store(&location)?;
                Ok(value.to_string())
            }
            DebugCommand::State => {
                let pc = self.vm.state()?.pc();
                let scope = self.vm.scope()?;
                Ok(format!(
                    "pc={pc} scope={} depth={} context={}",
                    scope.id(),
                    scope.depth(),
                    self.vm.current_queue_context()
                ))
            }
            DebugCommand::Exit => Ok("bye".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::runtime::local_streams::BufferSink;
    use std::sync::Arc;
    use svi_core::Config;

    fn debugger_for(source: &str) -> (Debugger, Arc<BufferSink>) {
        let sink = Arc::new(BufferSink::new());
        let pipeline = Pipeline::from_bytes(source.as_bytes().to_vec());
        let vm = pipeline
            .target_local(Config::default(), sink.clone())
            .expect("assemble");
        (Debugger::new(vm), sink)
    }

    #[test]
    fn command_parsing() {
        assert_eq!(DebugCommand::parse("PING"), Some(DebugCommand::Ping));
        assert_eq!(
            DebugCommand::parse("LOOKUP $l:x"),
            Some(DebugCommand::Lookup("$l:x".to_string()))
        );
        assert_eq!(DebugCommand::parse("LOOKUP"), None);
        assert_eq!(DebugCommand::parse("banana"), None);
    }

    #[test]
    fn step_lookup_and_exit() {
        let (mut debugger, _sink) = debugger_for("$l:a <- 41\n$l:b <- plus $l:a 1");
        let channel = LoopbackChannel::new();
        channel.queue_command("PING");
        channel.queue_command("STEP");
        channel.queue_command("LOOKUP $l:a");
        channel.queue_command("RUN");
        channel.queue_command("LOOKUP $l:b");
        channel.queue_command("EXIT");

        debugger.serve(&channel);

        let responses = channel.responses();
        assert_eq!(responses[0], "data.ping:pong");
        assert_eq!(responses[1], "data.step:pc=1");
        assert_eq!(responses[2], "data.lookup:41");
        assert_eq!(responses[3], "data.run:complete");
        assert_eq!(responses[4], "data.lookup:42");
        assert_eq!(responses[5], "data.exit:bye");
    }

    #[test]
    fn errors_use_the_error_prefix() {
        let (mut debugger, _sink) = debugger_for("out 1");
        let channel = LoopbackChannel::new();
        channel.queue_command("LOOKUP $l:missing");
        channel.queue_command("EXIT");

        debugger.serve(&channel);
        assert!(channel.responses()[0].starts_with("data.lookup.error:"));
    }

    #[test]
    fn state_exposes_opaque_ids_only() {
        let (mut debugger, _sink) = debugger_for("out 1");
        let channel = LoopbackChannel::new();
        channel.queue_command("STATE");
        channel.queue_command("EXIT");

        debugger.serve(&channel);
        let state = &channel.responses()[0];
        assert!(state.starts_with("data.state:pc=0 scope="));
    }
}
