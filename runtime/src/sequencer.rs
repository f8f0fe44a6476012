//! Statement sequencing.
//!
//! The sequencer tracks which remote objects exist inside the agent and
//! refuses any batch that references an object not created earlier in the
//! session. A batch is checked as a whole before the first statement is
//! sent, so a rejected batch leaves the remote interpreter untouched.
//!
//! Session setup is a one-shot phase: it is emitted exactly once, and
//! no other batch may be emitted before it.

use std::collections::HashMap;

use opennet_core::error::{NetError, Result};

use crate::channel::AgentChannel;
use crate::script::{Statement, REPLY_SOCKET};

/// Remote objects known to exist, keyed by name, with the position of the
/// statement that (last) bound them.
#[derive(Debug, Clone)]
pub struct ObjectTable {
    objects: HashMap<String, usize>,
    bound: usize,
}

impl ObjectTable {
    /// Table holding only the names the agent provides to every session.
    pub fn new() -> Self {
        let mut objects = HashMap::new();
        objects.insert(REPLY_SOCKET.to_string(), 0);
        Self { objects, bound: 0 }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    /// Position of the statement that bound `name`. Ambient names are 0.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.objects.get(name).copied()
    }

    /// Record a new binding. Rebinding a name moves it to the new position.
    pub fn bind(&mut self, name: &str) {
        self.bound += 1;
        self.objects.insert(name.to_string(), self.bound);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered statements emitted together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    statements: Vec<Statement>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, statement: Statement) -> &mut Self {
        self.statements.push(statement);
        self
    }

    pub fn extend(&mut self, statements: impl IntoIterator<Item = Statement>) -> &mut Self {
        self.statements.extend(statements);
        self
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }
}

impl From<Vec<Statement>> for Batch {
    fn from(statements: Vec<Statement>) -> Self {
        Self { statements }
    }
}

/// Orders statements onto the channel and guards creation-before-reference
#[derive(Debug, Default)]
pub struct Sequencer {
    objects: ObjectTable,
    setup_emitted: bool,
    emitted: usize,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup_emitted(&self) -> bool {
        self.setup_emitted
    }

    /// Statements emitted so far, setup included.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Check one statement against the current object table.
    pub fn check(&self, statement: &Statement) -> Result<()> {
        for name in statement.references() {
            if !self.objects.contains(name) {
                return Err(undefined(name, statement));
            }
        }
        Ok(())
    }

    /// Check a batch as if it were emitted now. Names bound by earlier
    /// statements of the batch are visible to later ones.
    pub fn validate(&self, batch: &Batch) -> Result<()> {
        let mut pending: Vec<&str> = Vec::new();
        for statement in batch.statements() {
            for name in statement.references() {
                if !self.objects.contains(name) && !pending.contains(&name) {
                    return Err(undefined(name, statement));
                }
            }
            if let Some(name) = statement.defines() {
                pending.push(name);
            }
        }
        Ok(())
    }

    /// Emit the session's one-time setup batch.
    pub async fn emit_setup(&mut self, channel: &mut AgentChannel, batch: &Batch) -> Result<()> {
        if self.setup_emitted {
            return Err(NetError::Sequence("session setup already emitted".to_string()));
        }
        self.send_batch(channel, batch).await?;
        self.setup_emitted = true;
        tracing::debug!(statements = batch.len(), "Session setup emitted");
        Ok(())
    }

    /// Emit a batch after setup.
    pub async fn emit(&mut self, channel: &mut AgentChannel, batch: &Batch) -> Result<()> {
        if !self.setup_emitted {
            return Err(NetError::Sequence(
                "statements emitted before session setup".to_string(),
            ));
        }
        self.send_batch(channel, batch).await
    }

    /// Statements that have to precede setup (slave-mode defaults). They
    /// may not reference session objects.
    pub async fn emit_preamble(&mut self, channel: &mut AgentChannel, batch: &Batch) -> Result<()> {
        if self.setup_emitted {
            return Err(NetError::Sequence(
                "preamble must precede session setup".to_string(),
            ));
        }
        self.send_batch(channel, batch).await
    }

    async fn send_batch(&mut self, channel: &mut AgentChannel, batch: &Batch) -> Result<()> {
        self.validate(batch)?;
        // Render everything first so a bad literal fails before any send
        let rendered = batch
            .statements()
            .iter()
            .map(Statement::render)
            .collect::<Result<Vec<_>>>()?;

        for (statement, text) in batch.statements().iter().zip(&rendered) {
            channel.send_text(text).await?;
            if let Some(name) = statement.defines() {
                self.objects.bind(name);
            }
            self.emitted += 1;
        }
        Ok(())
    }
}

fn undefined(name: &str, statement: &Statement) -> NetError {
    NetError::UndefinedReference {
        name: name.to_string(),
        statement: statement
            .render()
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| format!("{:?}", statement)),
    }
}
