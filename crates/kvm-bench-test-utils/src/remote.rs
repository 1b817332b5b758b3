//! Scripted guest sessions
//!
//! Commands are matched against substring rules in registration order. Each
//! rule plays its outcomes in sequence and repeats the last one; commands
//! matching no rule get the default outcome.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kvm_bench_coordinator::RemoteError;
use kvm_bench_coordinator::remote::{CommandOutput, Credentials, RemoteSession, SessionFactory};

/// How a scripted command behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    /// Runs to completion
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// The transport drops mid-command
    ConnectionLost,
    /// Never returns; only the caller's timeout ends it
    Hang,
    /// Waits, then behaves like the inner outcome
    Delayed(Duration, Box<Scripted>),
}

impl Scripted {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::Exit {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn after(delay: Duration, then: Scripted) -> Self {
        Self::Delayed(delay, Box::new(then))
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    outcomes: VecDeque<Scripted>,
}

impl Rule {
    fn next(&mut self) -> Scripted {
        if self.outcomes.len() > 1 {
            self.outcomes.pop_front().unwrap_or(Scripted::Hang)
        } else {
            self.outcomes.front().cloned().unwrap_or(Scripted::Hang)
        }
    }
}

#[derive(Debug)]
struct ScriptState {
    rules: Vec<Rule>,
    default: Scripted,
    refused_opens: u32,
    hung_opens: u32,
    opens: u32,
    executed: Vec<(String, String)>,
}

/// Session factory answering from a script
#[derive(Debug, Clone)]
pub struct ScriptedSessions {
    state: Arc<Mutex<ScriptState>>,
}

impl Default for ScriptedSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSessions {
    /// Every command succeeds with `score: 1` unless a rule says otherwise
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                rules: Vec::new(),
                default: Scripted::ok("score: 1"),
                refused_opens: 0,
                hung_opens: 0,
                opens: 0,
                executed: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commands containing `pattern` play `outcomes` in order, repeating the last
    pub fn on(self, pattern: &str, outcomes: impl IntoIterator<Item = Scripted>) -> Self {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            outcomes: outcomes.into_iter().collect(),
        });
        self
    }

    pub fn with_default(self, outcome: Scripted) -> Self {
        self.lock().default = outcome;
        self
    }

    /// The next `times` session opens are refused
    pub fn refuse_opens(self, times: u32) -> Self {
        self.lock().refused_opens = times;
        self
    }

    /// The next `times` session opens never complete
    pub fn hang_opens(self, times: u32) -> Self {
        self.lock().hung_opens = times;
        self
    }

    /// Sessions opened so far, refused and hung ones included
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    /// `(host, command)` for every command executed, in order
    pub fn executed(&self) -> Vec<(String, String)> {
        self.lock().executed.clone()
    }

    /// Commands executed whose text contains `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.lock()
            .executed
            .iter()
            .filter(|(_, cmd)| cmd.contains(pattern))
            .count()
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessions {
    async fn open(
        &self,
        host: &str,
        _credentials: &Credentials,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let hang = {
            let mut state = self.lock();
            state.opens += 1;
            if state.hung_opens > 0 {
                state.hung_opens -= 1;
                true
            } else if state.refused_opens > 0 {
                state.refused_opens -= 1;
                return Err(RemoteError::connection(host, "connection refused"));
            } else {
                false
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(Box::new(ScriptedSession {
            host: host.to_string(),
            sessions: self.clone(),
        }))
    }
}

struct ScriptedSession {
    host: String,
    sessions: ScriptedSessions,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn exec(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let mut outcome = {
            let mut state = self.sessions.lock();
            state.executed.push((self.host.clone(), command.to_string()));
            let rule = state.rules.iter_mut().find(|r| command.contains(&r.pattern));
            match rule {
                Some(rule) => rule.next(),
                None => state.default.clone(),
            }
        };

        loop {
            match outcome {
                Scripted::Exit {
                    code,
                    stdout,
                    stderr,
                } => {
                    return Ok(CommandOutput {
                        exit_code: code,
                        stdout,
                        stderr,
                    });
                }
                Scripted::ConnectionLost => {
                    return Err(RemoteError::connection(&self.host, "connection reset by peer"));
                }
                Scripted::Hang => std::future::pending::<()>().await,
                Scripted::Delayed(delay, then) => {
                    tokio::time::sleep(delay).await;
                    outcome = *then;
                }
            }
        }
    }
}
