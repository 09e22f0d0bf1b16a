//! Named remote commands with permission checks.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::components::{PermissionGroup, PermissionLevel};
use crate::connection::Connection;
use crate::error::TetherError;

/// A command invocable by name.
pub trait Command: Send + Sync + 'static {
    /// Run the command. `executor` is `None` for local invocations.
    fn execute(&self, args: &[Value], executor: Option<&Connection>) -> Result<Value, TetherError>;

    /// Lowest permission level allowed to run this command.
    fn required_permission(&self) -> PermissionLevel {
        PermissionLevel::Client
    }
}

/// Adapts a closure into a [`Command`].
pub struct FnCommand<F> {
    f: F,
    permission: PermissionLevel,
}

impl<F> FnCommand<F>
where
    F: Fn(&[Value], Option<&Connection>) -> Result<Value, TetherError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            permission: PermissionLevel::Client,
        }
    }

    pub fn with_permission(mut self, permission: PermissionLevel) -> Self {
        self.permission = permission;
        self
    }
}

impl<F> Command for FnCommand<F>
where
    F: Fn(&[Value], Option<&Connection>) -> Result<Value, TetherError> + Send + Sync + 'static,
{
    fn execute(&self, args: &[Value], executor: Option<&Connection>) -> Result<Value, TetherError> {
        (self.f)(args, executor)
    }

    fn required_permission(&self) -> PermissionLevel {
        self.permission
    }
}

#[derive(Default)]
pub struct CommandSystem {
    commands: DashMap<String, Arc<dyn Command>>,
}

impl CommandSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `command` under `name`, replacing any previous one.
    /// Returns `true` if a command was replaced.
    pub fn register_command(&self, name: &str, command: impl Command) -> bool {
        debug!(command = name, "command registered");
        self.commands
            .insert(name.to_string(), Arc::new(command))
            .is_some()
    }

    /// Register a closure with the default permission level.
    pub fn register_fn<F>(&self, name: &str, f: F) -> bool
    where
        F: Fn(&[Value], Option<&Connection>) -> Result<Value, TetherError> + Send + Sync + 'static,
    {
        self.register_command(name, FnCommand::new(f))
    }

    pub fn unregister_command(&self, name: &str) -> bool {
        self.commands.remove(name).is_some()
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.key().clone()).collect()
    }

    /// Run `name` with `args` on behalf of `executor`.
    ///
    /// A connection without a [`PermissionGroup`] is treated as a guest.
    pub fn execute(
        &self,
        name: &str,
        args: &[Value],
        executor: Option<&Connection>,
    ) -> Result<Value, TetherError> {
        let command = self
            .commands
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| TetherError::CommandNotFound(name.to_string()))?;

        if let Some(connection) = executor {
            let level = connection
                .components()
                .get::<PermissionGroup>()
                .map_or(PermissionLevel::Guest, |group| group.level());
            if level < command.required_permission() {
                return Err(TetherError::PermissionDenied {
                    command: name.to_string(),
                });
            }
        }

        command.execute(args, executor)
    }
}

impl std::fmt::Debug for CommandSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSystem")
            .field("commands", &self.command_names())
            .finish()
    }
}
