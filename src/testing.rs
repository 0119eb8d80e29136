//! An in-memory [`Transport`] that records every call and answers from a script.

use crate::{
    errors::ChannelError,
    target::Target,
    transport::{Location, OutputSinks, RemoteProcess, Transport},
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Exec { target: Target, command: String },
    Spawn { target: Target, command: String },
    Wait { target: Target },
    Terminate { target: Target },
    Copy { source: Location, destination: Location },
}

impl Call {
    pub fn target(&self) -> Option<&Target> {
        match self {
            Call::Exec { target, .. }
            | Call::Spawn { target, .. }
            | Call::Wait { target }
            | Call::Terminate { target } => Some(target),
            Call::Copy {
                source,
                destination,
            } => destination.target().or(source.target()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Exit(i32),
    Unreachable,
}

#[derive(Debug, Clone)]
struct Rule {
    target: Option<Target>,
    contains: String,
    reply: Reply,
}

impl Rule {
    fn matches(&self, target: &Target, text: &str) -> bool {
        self.target.as_ref().map_or(true, |t| t == target) && text.contains(&self.contains)
    }
}

#[derive(Default)]
pub struct ScriptedTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    exec_rules: Mutex<Vec<Rule>>,
    copy_rules: Mutex<Vec<Rule>>,
    unreachable: Mutex<Vec<Target>>,
    cancel_on: Mutex<Vec<(String, CancellationToken)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands (blocking or detached) on `target` (any target when `None`) containing
    /// `contains` get `reply`. Later rules win.
    pub fn on_exec(self, target: Option<&str>, contains: &str, reply: Reply) -> Self {
        self.exec_rules.lock().unwrap().push(Rule {
            target: target.map(Target::new),
            contains: contains.to_string(),
            reply,
        });
        self
    }

    /// Copies touching `target` whose remote path contains `contains` get `reply`.
    pub fn on_copy(self, target: Option<&str>, contains: &str, reply: Reply) -> Self {
        self.copy_rules.lock().unwrap().push(Rule {
            target: target.map(Target::new),
            contains: contains.to_string(),
            reply,
        });
        self
    }

    /// Cancels `token` once a blocking command containing `contains` has run.
    pub fn cancel_on(self, contains: &str, token: CancellationToken) -> Self {
        self.cancel_on
            .lock()
            .unwrap()
            .push((contains.to_string(), token));
        self
    }

    pub fn unreachable(self, target: &str) -> Self {
        self.unreachable.lock().unwrap().push(Target::new(target));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, target: &str) -> Vec<Call> {
        let target = Target::new(target);
        self.calls()
            .into_iter()
            .filter(|call| call.target() == Some(&target))
            .collect()
    }

    /// Commands run or spawned on `target`, in order.
    pub fn commands_for(&self, target: &str) -> Vec<String> {
        self.calls_for(target)
            .into_iter()
            .filter_map(|call| match call {
                Call::Exec { command, .. } | Call::Spawn { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn count_matching(&self, contains: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| match call {
                Call::Exec { command, .. } | Call::Spawn { command, .. } => {
                    command.contains(contains)
                }
                _ => false,
            })
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn is_unreachable(&self, target: &Target) -> bool {
        self.unreachable.lock().unwrap().contains(target)
    }

    fn reply(rules: &Mutex<Vec<Rule>>, target: &Target, text: &str) -> Reply {
        rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|rule| rule.matches(target, text))
            .map(|rule| rule.reply)
            .unwrap_or(Reply::Exit(0))
    }

    fn answer(&self, target: &Target, reply: Reply) -> Result<i32, ChannelError> {
        if self.is_unreachable(target) {
            return Err(ChannelError::Unreachable {
                target: target.clone(),
                reason: "scripted".to_string(),
            });
        }
        match reply {
            Reply::Exit(code) => Ok(code),
            Reply::Unreachable => Err(ChannelError::Unreachable {
                target: target.clone(),
                reason: "scripted".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn exec(&self, target: &Target, command: &str) -> Result<i32, ChannelError> {
        self.record(Call::Exec {
            target: target.clone(),
            command: command.to_string(),
        });
        let reply = Self::reply(&self.exec_rules, target, command);
        for (contains, token) in self.cancel_on.lock().unwrap().iter() {
            if command.contains(contains.as_str()) {
                token.cancel();
            }
        }
        self.answer(target, reply)
    }

    async fn spawn(
        &self,
        target: &Target,
        command: &str,
        _sinks: &OutputSinks,
    ) -> Result<Box<dyn RemoteProcess>, ChannelError> {
        self.record(Call::Spawn {
            target: target.clone(),
            command: command.to_string(),
        });
        if self.is_unreachable(target) {
            return Err(ChannelError::Unreachable {
                target: target.clone(),
                reason: "scripted".to_string(),
            });
        }
        let reply = Self::reply(&self.exec_rules, target, command);
        Ok(Box::new(ScriptedProcess {
            target: target.clone(),
            reply,
            exited: false,
            calls: self.calls.clone(),
        }))
    }

    async fn copy(&self, source: &Location, destination: &Location) -> Result<i32, ChannelError> {
        self.record(Call::Copy {
            source: source.clone(),
            destination: destination.clone(),
        });
        let (target, path) = match (source, destination) {
            (Location::Remote { target, path }, _) | (_, Location::Remote { target, path }) => {
                (target.clone(), path.clone())
            }
            _ => (Target::new("localhost"), String::new()),
        };
        let reply = Self::reply(&self.copy_rules, &target, &path);
        let code = self.answer(&target, reply)?;
        if code == 0 {
            if let Location::Local(local) = destination {
                let _ = std::fs::write(local, b"scripted");
            }
        }
        Ok(code)
    }
}

struct ScriptedProcess {
    target: Target,
    reply: Reply,
    exited: bool,
    calls: Arc<Mutex<Vec<Call>>>,
}

#[async_trait]
impl RemoteProcess for ScriptedProcess {
    async fn wait(&mut self) -> Result<i32, ChannelError> {
        self.calls.lock().unwrap().push(Call::Wait {
            target: self.target.clone(),
        });
        self.exited = true;
        match self.reply {
            Reply::Exit(code) => Ok(code),
            Reply::Unreachable => Err(ChannelError::Unreachable {
                target: self.target.clone(),
                reason: "scripted".to_string(),
            }),
        }
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }

    fn terminate(&mut self) -> Result<(), ChannelError> {
        self.calls.lock().unwrap().push(Call::Terminate {
            target: self.target.clone(),
        });
        self.exited = true;
        Ok(())
    }
}
