use crate::network::{CommandOutput, CommandRunner};
use std::cell::RefCell;
use std::io;
use std::sync::{Mutex, MutexGuard, OnceLock};

pub fn serial_guard() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

/// Records every command and emulates the `ip link` and `iptables -t nat` state
/// they would have changed.
#[derive(Default)]
pub struct RecordingRunner {
    commands: RefCell<Vec<Vec<String>>>,
    rules: RefCell<Vec<(String, Vec<String>)>>,
    links: RefCell<Vec<(String, String)>>,
    failing: RefCell<Vec<String>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every command whose joined command line contains `needle`
    pub fn fail_when(&self, needle: &str) {
        self.failing.borrow_mut().push(needle.to_string());
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.borrow().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.commands.borrow().iter().map(|c| c.join(" ")).collect()
    }

    pub fn installed_rules(&self) -> Vec<(String, Vec<String>)> {
        self.rules.borrow().clone()
    }

    pub fn links(&self) -> Vec<(String, String)> {
        self.links.borrow().clone()
    }

    /// Simulate the kernel destroying a pair with its namespace
    pub fn destroy_link(&self, name: &str) {
        self.links
            .borrow_mut()
            .retain(|(a, b)| a != name && b != name);
    }

    fn iptables(&self, argv: &[String]) -> CommandOutput {
        let (Some(action), Some(chain)) = (argv.get(3), argv.get(4)) else {
            return CommandOutput::failed("bad iptables invocation");
        };
        let args = argv[5..].to_vec();
        let mut rules = self.rules.borrow_mut();
        let position = rules.iter().position(|(c, s)| c == chain && *s == args);

        match (action.as_str(), position) {
            ("-C", Some(_)) => CommandOutput::ok(),
            ("-C", None) => CommandOutput::failed("Bad rule (does a matching rule exist in that chain?)."),
            ("-A", _) => {
                rules.push((chain.clone(), args));
                CommandOutput::ok()
            }
            ("-D", Some(index)) => {
                rules.remove(index);
                CommandOutput::ok()
            }
            ("-D", None) => CommandOutput::failed("Bad rule (does a matching rule exist in that chain?)."),
            _ => CommandOutput::failed("unsupported iptables action"),
        }
    }

    fn ip(&self, argv: &[String]) -> CommandOutput {
        let words: Vec<&str> = argv.iter().map(String::as_str).collect();
        let mut links = self.links.borrow_mut();

        match words.as_slice() {
            ["ip", "link", "add", name, "type", "veth", "peer", "name", peer] => {
                let taken = links
                    .iter()
                    .any(|(a, b)| [a, b].iter().any(|n| n == name || n == peer));
                if taken {
                    return CommandOutput::failed("RTNETLINK answers: File exists");
                }
                links.push((name.to_string(), peer.to_string()));
                CommandOutput::ok()
            }
            ["ip", "link", "del", name] => {
                let before = links.len();
                links.retain(|(a, b)| a != name && b != name);
                if links.len() == before {
                    CommandOutput::failed(format!("Cannot find device \"{}\"", name))
                } else {
                    CommandOutput::ok()
                }
            }
            _ => CommandOutput::ok(),
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn execute(&self, argv: &[String]) -> io::Result<CommandOutput> {
        self.commands.borrow_mut().push(argv.to_vec());

        let line = argv.join(" ");
        if self.failing.borrow().iter().any(|needle| line.contains(needle)) {
            return Ok(CommandOutput::failed("injected failure"));
        }

        Ok(match argv.first().map(String::as_str) {
            Some("iptables") => self.iptables(argv),
            Some("ip") => self.ip(argv),
            _ => CommandOutput::ok(),
        })
    }
}
