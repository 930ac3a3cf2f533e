//! Command registry and dispatch.
//!
//! A [`Commands`] table maps names such as `/nick` to handlers. The room's
//! consumer calls [`Commands::run`] for every [`CommandMsg`]; failures are
//! returned to it and shown to the issuing user as `-> Err: ...` lines.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::message::CommandMsg;
use crate::room::{Room, RoomError};
use crate::user::UserError;

/// Reasons a command was refused or failed.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The command has no issuing user.
    #[error("command has no owner")]
    NoOwner,

    /// No command is registered under this name.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The command requires operator status.
    #[error("must be an operator")]
    NotOp,

    /// A required argument was not given.
    #[error("missing argument")]
    MissingArg,

    /// The named user is not in the room.
    #[error("user not found")]
    UserNotFound,

    /// A room operation failed.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A user operation failed.
    #[error(transparent)]
    User(#[from] UserError),

    /// Any other usage error, with a message for the user.
    #[error("{0}")]
    Invalid(String),
}

/// Signature every command handler implements.
///
/// Handlers run on the room's consumer task and must not block. They reply
/// with [`Room::post`], which queues messages behind the current one.
pub type Handler = Arc<dyn Fn(&Room, &CommandMsg) -> Result<(), CommandError> + Send + Sync>;

/// A registered command.
#[derive(Clone)]
pub struct Command {
    /// Name including the prefix, e.g. `/msg`.
    pub name: &'static str,
    /// Argument synopsis for `/help`, e.g. `<user> <message>`.
    pub args_help: &'static str,
    /// One-line description for `/help`.
    pub help: &'static str,
    /// Whether only operators may run it.
    pub op: bool,
    /// The handler.
    pub handler: Handler,
}

impl Command {
    /// Creates a command anyone may run.
    pub fn new(
        name: &'static str,
        args_help: &'static str,
        help: &'static str,
        handler: impl Fn(&Room, &CommandMsg) -> Result<(), CommandError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            args_help,
            help,
            op: false,
            handler: Arc::new(handler),
        }
    }

    /// Restricts the command to operators.
    #[must_use]
    pub const fn op_only(mut self) -> Self {
        self.op = true;
        self
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("op", &self.op)
            .finish_non_exhaustive()
    }
}

/// Command table, in registration order.
#[derive(Default, Clone, Debug)]
pub struct Commands {
    by_name: HashMap<String, Command>,
    order: Vec<&'static str>,
}

impl Commands {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `cmd`, replacing any command with the same name.
    pub fn add(&mut self, cmd: Command) {
        let name = cmd.name.to_lowercase();
        if self.by_name.insert(name, cmd.clone()).is_none() {
            self.order.push(cmd.name);
        }
    }

    /// Looks a command up by name, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.by_name.get(&name.to_lowercase())
    }

    /// Dispatches `msg` to its handler.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NoOwner`] for a message with no sender,
    /// [`CommandError::InvalidCommand`] for an unknown name,
    /// [`CommandError::NotOp`] if the sender lacks operator status for an
    /// operator command, and otherwise whatever the handler returns.
    pub fn run(&self, room: &Room, msg: &CommandMsg) -> Result<(), CommandError> {
        let from = msg.from.as_ref().ok_or(CommandError::NoOwner)?;
        let cmd = self
            .get(&msg.name)
            .ok_or_else(|| CommandError::InvalidCommand(msg.name.clone()))?;
        if cmd.op && !room.is_op(from) {
            return Err(CommandError::NotOp);
        }
        tracing::debug!(user = %from.name(), command = cmd.name, "running command");
        (cmd.handler)(room, msg)
    }

    /// Help text listing the commands visible to an operator or not.
    #[must_use]
    pub fn help(&self, op: bool) -> String {
        let visible: Vec<&Command> = self
            .order
            .iter()
            .filter_map(|name| self.get(name))
            .filter(|cmd| cmd.op == op)
            .collect();
        let width = visible
            .iter()
            .map(|cmd| cmd.name.len() + cmd.args_help.len() + 1)
            .max()
            .unwrap_or(0);
        visible
            .iter()
            .map(|cmd| {
                let usage = format!("{} {}", cmd.name, cmd.args_help);
                format!("{:width$}  {}", usage.trim_end(), cmd.help)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Registered names starting with `prefix`, in registration order.
    #[must_use]
    pub fn names(&self, prefix: &str) -> Vec<&'static str> {
        let prefix = prefix.to_lowercase();
        self.order
            .iter()
            .copied()
            .filter(|name| name.to_lowercase().starts_with(&prefix))
            .collect()
    }
}
