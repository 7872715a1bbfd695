//! One server entity mirrored on the client.
//!
//! Entities are plain state; every behavior that touches more than one of
//! them (parenting, view aliases, outbound sync) lives in [`crate::world`].

use std::collections::HashMap;

use kbe_shared::{ClassDef, Value};

use crate::math::Vec3;

/// Extra transform updates streamed to the server after movement stops,
/// so the last position is never lost to a dropped change.
pub const EXTRA_SYNC_BUDGET: u8 = 8;

pub struct Entity {
    pub id: i32,
    pub class_name: String,
    /// Creation finished, including the buffered-property replay.
    pub inited: bool,
    pub in_world: bool,
    /// Steered by this client instead of the server.
    pub is_controlled: bool,
    pub is_on_ground: bool,

    /// World-space position, metres.
    pub position: Vec3,
    /// World-space (roll, pitch, yaw) euler direction, radians.
    pub direction: Vec3,
    /// Parent-space transform; mirrors the world transform while the
    /// entity has no attached parent.
    pub local_position: Vec3,
    pub local_direction: Vec3,

    pub last_sync_pos: Vec3,
    pub last_sync_dir: Vec3,
    pub last_sync_local_pos: Vec3,
    pub last_sync_local_dir: Vec3,

    /// Server-announced parent id; 0 means none. The parent may not be
    /// in view yet, in which case `parent_attached` stays false.
    pub parent_id: i32,
    pub parent_attached: bool,
    pub child_ids: Vec<i32>,

    /// Remote call targets granted so far.
    pub has_base: bool,
    pub has_cell: bool,

    pub extra_sync_budget: u8,
    /// Property values keyed by server utype.
    pub properties: HashMap<u16, Value>,
}

impl Entity {
    /// Seeds every client-visible property with its schema default.
    pub fn new(id: i32, class: &ClassDef) -> Entity {
        let properties: HashMap<u16, Value> = class
            .properties()
            .iter()
            .map(|prop| (prop.utype, prop.default.clone()))
            .collect();

        Entity {
            id,
            class_name: class.name().to_string(),
            inited: false,
            in_world: false,
            is_controlled: false,
            is_on_ground: false,
            position: Vec3::ZERO,
            direction: Vec3::ZERO,
            local_position: Vec3::ZERO,
            local_direction: Vec3::ZERO,
            last_sync_pos: Vec3::ZERO,
            last_sync_dir: Vec3::ZERO,
            last_sync_local_pos: Vec3::ZERO,
            last_sync_local_dir: Vec3::ZERO,
            parent_id: 0,
            parent_attached: false,
            child_ids: Vec::new(),
            has_base: false,
            has_cell: false,
            extra_sync_budget: EXTRA_SYNC_BUDGET,
            properties,
        }
    }

    pub fn property(&self, utype: u16) -> Option<&Value> {
        self.properties.get(&utype)
    }

    pub fn set_property(&mut self, utype: u16, value: Value) {
        self.properties.insert(utype, value);
    }
}
