//! Interactive console: the one place this crate touches a second thread.
//!
//! A background thread reads stdin lines and pushes them into a channel;
//! the reactor drains the channel on an interval and dispatches commands on
//! its own thread. The reader never touches shared state, so nothing here
//! needs synchronization beyond the channel itself.
//!
//! Commands are an explicit name → handler registry assembled with
//! [`Console::command`]; output goes straight to stdout, not the log.

use crate::reactor::Reactor;
use crossbeam_channel::{unbounded, Receiver};
use std::io::BufRead as _;
use std::time::Duration;

const DRAIN_INTERVAL: Duration = Duration::from_millis(250);

struct Command {
    name: &'static str,
    usage: &'static str,
    help: &'static str,
    handler: Box<dyn FnMut(&mut Reactor, &str)>,
}

pub struct Console {
    lines: Receiver<String>,
    commands: Vec<Command>,
}

impl Console {
    /// Spawns the stdin reader thread. The thread exits when stdin closes
    /// or the console is dropped.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        std::thread::Builder::new()
            .name("console-stdin".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .expect("spawn console reader thread");
        Self {
            lines: rx,
            commands: Vec::new(),
        }
    }

    /// Registers a command; the handler receives everything after the
    /// command word, trimmed.
    pub fn command(
        mut self,
        name: &'static str,
        usage: &'static str,
        help: &'static str,
        handler: impl FnMut(&mut Reactor, &str) + 'static,
    ) -> Self {
        self.commands.push(Command {
            name,
            usage,
            help,
            handler: Box::new(handler),
        });
        self
    }

    /// Hands the console to the reactor, which drains pending lines on a
    /// fixed interval.
    pub fn start(mut self, reactor: &mut Reactor) {
        reactor.interval(DRAIN_INTERVAL, move |reactor| {
            while let Ok(line) = self.lines.try_recv() {
                self.dispatch(reactor, line.trim());
            }
            true
        });
    }

    fn dispatch(&mut self, reactor: &mut Reactor, line: &str) {
        if line.is_empty() {
            return;
        }
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        if name == "help" {
            self.print_help();
            return;
        }
        match self.commands.iter_mut().find(|c| c.name == name) {
            Some(command) => (command.handler)(reactor, rest),
            None => println!("unknown command '{name}', try 'help'"),
        }
    }

    fn print_help(&self) {
        println!("commands:");
        println!("  {:<24} {}", "help", "this text");
        for command in &self.commands {
            println!("  {:<24} {}", command.usage, command.help);
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}
