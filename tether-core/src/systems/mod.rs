//! Pluggable capability systems shared by connections, servers and clients.

pub mod command;
pub mod component;
pub mod event;
pub mod task;

pub use command::{Command, CommandSystem, FnCommand};
pub use component::{Component, ComponentSystem};
pub use event::{ClientEvent, EventHandler, EventSystem, HandlerId, NetworkEvent, ServerEvent};
pub use task::{TaskSnapshot, TaskSystem};

/// The four capability systems owned by every connection, server and client.
#[derive(Debug, Default)]
pub struct Systems {
    pub components: ComponentSystem,
    pub events: EventSystem,
    pub tasks: TaskSystem,
    pub commands: CommandSystem,
}

impl Systems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every task and detach every component.
    pub fn release(&self) {
        self.tasks.cancel_all();
        self.components.remove_all();
    }
}
