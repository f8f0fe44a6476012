//! In-memory stand-ins for the agent connection and the emulated hosts.
//!
//! Used by `opennet plan` to print what a scenario would do, and by the
//! tests to observe statement order and shell commands.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use opennet_core::error::{NetError, Result};

use crate::channel::Transport;
use crate::host::{EmulatedHost, HostSpec};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared, append-only record of what was sent.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: String) {
        lock(&self.entries).push(entry);
    }

    /// Every recorded entry, oldest first.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Number of entries containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| e.contains(needle))
            .count()
    }

    /// Index of the first entry containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e.contains(needle))
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

type Responder = Box<dyn FnMut(&str) -> Option<Vec<u8>> + Send>;

/// Transport that records every statement and answers queries from a
/// script of queued replies, falling back to a responder function.
pub struct RecordingTransport {
    log: Transcript,
    replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    responder: Option<Responder>,
    last_query: Option<String>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            log: Transcript::new(),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            responder: None,
            last_query: None,
        }
    }

    /// Answer every query the way a healthy agent would: the worker is
    /// not running until started and stops when asked, bridges come up
    /// immediately.
    pub fn healthy_agent() -> Self {
        let mut alive = false;
        Self::new().with_responder(move |query| {
            if query.contains("nsThread.start ()") {
                alive = true;
                return None;
            }
            if query.contains("Simulator.Stop (Seconds (1))") {
                alive = false;
                return None;
            }
            if query.contains("nsThread.isAlive ()") {
                let reply: &[u8] = if alive { b"True" } else { b"False" };
                return Some(reply.to_vec());
            }
            if query.contains("IsLinkUp ()") {
                return Some(b"True".to_vec());
            }
            None
        })
    }

    /// Responder invoked with every sent statement. Its answer, if any, is
    /// queued behind replies already pushed.
    pub fn with_responder(
        mut self,
        responder: impl FnMut(&str) -> Option<Vec<u8>> + Send + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Queue one reply, consumed by the next `recv` in order.
    pub fn push_reply(&self, reply: impl AsRef<[u8]>) {
        lock(&self.replies).push_back(reply.as_ref().to_vec());
    }

    /// Handle for inspecting sent statements after the transport has been
    /// moved into a channel.
    pub fn log(&self) -> Transcript {
        self.log.clone()
    }

    /// Handle for queueing replies after the transport has been moved.
    pub fn replies(&self) -> ReplyQueue {
        ReplyQueue {
            replies: Arc::clone(&self.replies),
        }
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue handle returned by [`RecordingTransport::replies`]
#[derive(Clone)]
pub struct ReplyQueue {
    replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl ReplyQueue {
    pub fn push(&self, reply: impl AsRef<[u8]>) {
        lock(&self.replies).push_back(reply.as_ref().to_vec());
    }

    pub fn len(&self) -> usize {
        lock(&self.replies).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.replies).is_empty()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        if let Some(responder) = self.responder.as_mut() {
            if let Some(reply) = responder(&text) {
                lock(&self.replies).push_back(reply);
            }
        }
        if text.starts_with("if ") {
            self.last_query = Some(text.clone());
        }
        self.log.push(text);
        Ok(())
    }

    async fn recv(&mut self, max: usize) -> std::io::Result<Vec<u8>> {
        let mut reply = lock(&self.replies).pop_front().unwrap_or_default();
        reply.truncate(max);
        Ok(reply)
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.log.push("<close>".to_string());
        Ok(())
    }
}

impl std::fmt::Debug for RecordingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingTransport")
            .field("sent", &self.log.len())
            .field("last_query", &self.last_query)
            .finish()
    }
}

/// Where a recorded host command ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandScope {
    /// Inside the host's namespace
    Host,
    /// In the root namespace on the host's machine
    Root,
}

/// One recorded shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub host: String,
    pub scope: CommandScope,
    pub command: String,
}

/// Host that records commands instead of running them
#[derive(Debug)]
pub struct RecordingHost {
    name: String,
    netns: Option<String>,
    next_port: AtomicU32,
    commands: Arc<Mutex<Vec<HostCommand>>>,
    fail_on: Mutex<Vec<String>>,
}

impl RecordingHost {
    /// Host living in its own network namespace.
    pub fn namespaced(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            netns: Some(name.clone()),
            name,
            next_port: AtomicU32::new(0),
            commands: Arc::new(Mutex::new(Vec::new())),
            fail_on: Mutex::new(Vec::new()),
        }
    }

    /// Host running in the root namespace (switches).
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            netns: None,
            next_port: AtomicU32::new(0),
            commands: Arc::new(Mutex::new(Vec::new())),
            fail_on: Mutex::new(Vec::new()),
        }
    }

    /// Host matching a scenario entry; its namespace keeps the configured name.
    pub fn for_spec(spec: &HostSpec) -> Self {
        Self {
            name: spec.name.clone(),
            netns: spec.netns.clone(),
            next_port: AtomicU32::new(0),
            commands: Arc::new(Mutex::new(Vec::new())),
            fail_on: Mutex::new(Vec::new()),
        }
    }

    /// Share a command log with other hosts so ordering across hosts is
    /// visible in one place.
    pub fn sharing_log(mut self, log: &CommandLog) -> Self {
        self.commands = Arc::clone(&log.commands);
        self
    }

    /// Fail any command containing `needle`.
    pub fn fail_on(&self, needle: impl Into<String>) {
        lock(&self.fail_on).push(needle.into());
    }

    /// Stop failing commands.
    pub fn heal(&self) {
        lock(&self.fail_on).clear();
    }

    pub fn log(&self) -> CommandLog {
        CommandLog {
            commands: Arc::clone(&self.commands),
        }
    }

    fn record(&self, scope: CommandScope, command: &str) -> Result<String> {
        lock(&self.commands).push(HostCommand {
            host: self.name.clone(),
            scope,
            command: command.to_string(),
        });
        if lock(&self.fail_on).iter().any(|n| command.contains(n.as_str())) {
            return Err(NetError::Command {
                host: self.name.clone(),
                command: command.to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(String::new())
    }
}

#[async_trait]
impl EmulatedHost for RecordingHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_namespace(&self) -> bool {
        self.netns.is_some()
    }

    fn namespace_target(&self) -> String {
        self.netns.clone().unwrap_or_else(|| "1".to_string())
    }

    fn new_port(&self) -> u32 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }

    async fn cmd(&self, command: &str) -> Result<String> {
        self.record(CommandScope::Host, command)
    }

    async fn rcmd(&self, command: &str) -> Result<String> {
        self.record(CommandScope::Root, command)
    }
}

/// Shared handle on recorded host commands
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    commands: Arc<Mutex<Vec<HostCommand>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<HostCommand> {
        lock(&self.commands).clone()
    }

    /// Command strings only, in order.
    pub fn lines(&self) -> Vec<String> {
        lock(&self.commands)
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        lock(&self.commands)
            .iter()
            .filter(|c| c.command.contains(needle))
            .count()
    }
}
