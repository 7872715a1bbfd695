//! Typed events handed to the embedding game loop.
//!
//! Nothing in the crate calls back into user code from the middle of
//! packet processing. Handlers push onto the queue and the embedder drains
//! it once per frame, after `process()`.

use std::collections::VecDeque;

use kbe_shared::Value;

use crate::math::Vec3;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Loginapp handshake finished; code 0 is success, anything else is a
    /// server error id resolvable through the error table.
    LoginAppConnected { code: i32 },
    /// Gateway handshake finished.
    BaseAppConnected { code: i32 },
    VersionNotMatch {
        client_version: String,
        server_version: String,
    },
    ScriptVersionNotMatch {
        client_version: String,
        server_version: String,
    },
    LoginFailed {
        code: i32,
        name: String,
        descr: String,
    },
    LoginSuccess { account: String },
    AccountCreated {
        code: i32,
        name: String,
        descr: String,
    },
    PasswordReset {
        code: i32,
        name: String,
        descr: String,
    },
    AccountEmailBound {
        code: i32,
        name: String,
        descr: String,
    },
    PasswordChanged {
        code: i32,
        name: String,
        descr: String,
    },
    ReloginResult {
        code: i32,
        name: String,
        descr: String,
    },
    Kicked {
        code: i32,
        name: String,
        descr: String,
    },
    /// The active server connection was lost. Pushed at most once per
    /// connection lifetime, and never for a deliberate disconnect.
    Disconnected,

    EntityCreated {
        entity_id: i32,
        class_name: String,
    },
    EntityDestroyed { entity_id: i32 },
    EntityEnterWorld {
        entity_id: i32,
        class_name: String,
        is_player: bool,
    },
    EntityLeaveWorld {
        entity_id: i32,
        is_player: bool,
    },
    EntityEnterSpace {
        entity_id: i32,
        space_id: u32,
        is_player: bool,
    },
    EntityLeaveSpace {
        entity_id: i32,
        is_player: bool,
    },
    PropertyChanged {
        entity_id: i32,
        name: String,
        value: Value,
    },
    MethodCall {
        entity_id: i32,
        name: String,
        args: Vec<Value>,
    },
    /// The server overrode the entity's position outside the volatile
    /// stream (teleport or property write).
    PositionForced {
        entity_id: i32,
        position: Vec3,
    },
    DirectionForced {
        entity_id: i32,
        direction: Vec3,
    },
    ControlledChanged {
        entity_id: i32,
        is_controlled: bool,
    },
    GotParent {
        entity_id: i32,
        parent_id: i32,
    },
    LostParent { entity_id: i32 },

    /// `value` is `None` when the key was deleted.
    SpaceDataChanged {
        space_id: u32,
        key: String,
        value: Option<String>,
    },
    SpaceGeometryMapping {
        space_id: u32,
        res_path: String,
    },

    StreamDataStarted {
        id: u16,
        data_size: u32,
        descr: String,
    },
    StreamDataRecv { id: u16, data: Vec<u8> },
    StreamDataCompleted { id: u16 },
}

/// FIFO of pending events. Cheap to move whole frames out of.
#[derive(Debug, Default)]
pub struct Events {
    queue: VecDeque<ClientEvent>,
}

impl Events {
    pub fn new() -> Events {
        Events::default()
    }

    pub(crate) fn push(&mut self, event: ClientEvent) {
        self.queue.push_back(event);
    }

    /// Takes every pending event, oldest first.
    pub fn drain(&mut self) -> Vec<ClientEvent> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
