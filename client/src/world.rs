//! The client-side entity world: every entity the server has pushed into
//! view, the space they live in, and the transform sync loop that reports
//! player movement back.
//!
//! Handlers mirror the `Client_*` message set of the gateway protocol. A
//! malformed body surfaces as a [`WorldError`] and poisons the connection;
//! anything recoverable (an unknown entity id, a stale view alias) is
//! logged and the message dropped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use thiserror::Error;

use kbe_shared::{
    Bundle, ByteStream, MessageCatalog, SchemaError, SchemaRegistry, SegmentSink, StreamError,
    Value,
};

use crate::config::ClientConfig;
use crate::entity::{Entity, EXTRA_SYNC_BUDGET};
use crate::events::{ClientEvent, Events};
use crate::math::{self, Vec3, FLT_MAX};

/// Outbound transform updates are throttled to one batch per window.
const SYNC_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum movement (euclidean, over a position or euler-angle triple)
/// that counts as a change worth reporting.
const MOVE_EPSILON: f32 = 0.1;

/// Gameplay setters ignore jitter below this distance.
const SET_EPSILON: f32 = 0.001;

/// A decode failure inside a world message. Both variants mean the inbound
/// byte stream can no longer be trusted.
#[derive(Debug, Error)]
pub enum WorldError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Entity table plus the per-space bookkeeping that hangs off it.
pub struct World {
    entities: HashMap<i32, Entity>,
    player_id: i32,
    player_uuid: u64,
    player_class: String,
    /// Server-controlled entities this client moves. Never holds the player.
    controlled: Vec<i32>,
    /// In-view entity ids in server announcement order; the index is the
    /// one-byte alias compact messages address entities by.
    aoi_aliases: Vec<i32>,
    /// Property messages that arrived before their entity, keyed by entity
    /// id. At most one per entity.
    buffered: HashMap<i32, ByteStream>,
    space_id: u32,
    space_data: HashMap<String, String>,
    space_res_path: String,
    is_loaded_geometry: bool,
    /// Base position packed volatile coordinates are relative to.
    server_pos: Vec3,
    last_sync_time: Instant,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            player_id: 0,
            player_uuid: 0,
            player_class: String::new(),
            controlled: Vec::new(),
            aoi_aliases: Vec::new(),
            buffered: HashMap::new(),
            space_id: 0,
            space_data: HashMap::new(),
            space_res_path: String::new(),
            is_loaded_geometry: false,
            server_pos: Vec3::ZERO,
            last_sync_time: Instant::now(),
        }
    }

    // ---- lookups ----------------------------------------------------

    pub fn player_id(&self) -> i32 {
        self.player_id
    }

    pub fn player_uuid(&self) -> u64 {
        self.player_uuid
    }

    pub(crate) fn set_player_uuid(&mut self, uuid: u64) {
        self.player_uuid = uuid;
    }

    pub fn player(&self) -> Option<&Entity> {
        self.entities.get(&self.player_id)
    }

    pub fn entity(&self, id: i32) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn is_controlled(&self, id: i32) -> bool {
        self.controlled.contains(&id)
    }

    pub fn space_id(&self) -> u32 {
        self.space_id
    }

    pub fn space_data(&self, key: &str) -> Option<&str> {
        self.space_data.get(key).map(String::as_str)
    }

    pub fn space_res_path(&self) -> &str {
        &self.space_res_path
    }

    pub fn is_loaded_geometry(&self) -> bool {
        self.is_loaded_geometry
    }

    // ---- player proxy -----------------------------------------------

    pub fn on_created_proxies(
        &mut self,
        stream: &mut ByteStream,
        schema: &SchemaRegistry,
        config: &ClientConfig,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let uuid = stream.read_u64()?;
        let eid = stream.read_i32()?;
        let class_name = stream.read_string()?;

        debug!(
            "World::on_created_proxies: uuid({}) eid({}) class({})",
            uuid, eid, class_name
        );

        self.player_uuid = uuid;
        self.player_id = eid;
        self.player_class = class_name.clone();

        if self.entities.contains_key(&eid) {
            // Reconnect with the proxy still alive; only replay what queued
            // up while it was gone.
            if let Some(mut queued) = self.buffered.remove(&eid) {
                self.on_update_properties(&mut queued, schema, events)?;
            }
            return Ok(());
        }

        let class = match schema.class(&class_name) {
            Some(class) => class,
            None => {
                error!(
                    "World::on_created_proxies: unknown entity class {}",
                    class_name
                );
                return Ok(());
            }
        };

        let mut entity = Entity::new(eid, class);
        entity.has_base = true;
        self.entities.insert(eid, entity);

        if let Some(mut queued) = self.buffered.remove(&eid) {
            self.on_update_properties(&mut queued, schema, events)?;
        }

        if let Some(entity) = self.entities.get_mut(&eid) {
            entity.inited = true;
        }
        events.push(ClientEvent::EntityCreated {
            entity_id: eid,
            class_name,
        });

        if config.is_on_init_call_propertys_set_methods {
            self.announce_all_properties(eid, schema, events);
        }
        Ok(())
    }

    // ---- property updates -------------------------------------------

    pub fn on_update_properties(
        &mut self,
        stream: &mut ByteStream,
        schema: &SchemaRegistry,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;

        if !self.entities.contains_key(&eid) {
            if self.buffered.contains_key(&eid) {
                error!(
                    "World::on_update_properties: entity {} already has a buffered message",
                    eid
                );
                return Ok(());
            }
            // Keep the whole message, id included, for replay at creation.
            stream.set_rpos(stream.rpos() - 4);
            self.buffered.insert(eid, ByteStream::from_bytes(stream.remaining()));
            return Ok(());
        }

        self.apply_properties(eid, stream, schema, events)
    }

    pub fn on_update_properties_optimized(
        &mut self,
        stream: &mut ByteStream,
        schema: &SchemaRegistry,
        config: &ClientConfig,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        if !config.use_alias_entity_id || self.aoi_aliases.len() > 255 {
            // Wide form; identical to the plain message from here on,
            // buffering included.
            return self.on_update_properties(stream, schema, events);
        }

        let alias = stream.read_u8()? as usize;
        let eid = if self.aoi_aliases.len() <= alias {
            0
        } else {
            self.aoi_aliases[alias]
        };
        if eid == 0 || !self.entities.contains_key(&eid) {
            warn!(
                "World::on_update_properties_optimized: stale view alias {}, dropped",
                alias
            );
            return Ok(());
        }
        self.apply_properties(eid, stream, schema, events)
    }

    fn apply_properties(
        &mut self,
        eid: i32,
        stream: &mut ByteStream,
        schema: &SchemaRegistry,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let class_name = match self.entities.get(&eid) {
            Some(entity) => entity.class_name.clone(),
            None => {
                error!("World::apply_properties: unknown entity {}", eid);
                return Ok(());
            }
        };
        let class = match schema.class(&class_name) {
            Some(class) => class,
            None => {
                error!("World::apply_properties: unknown class {}", class_name);
                return Ok(());
            }
        };

        while stream.length() > 0 {
            let key = if class.use_property_alias() {
                stream.read_u8()? as u16
            } else {
                stream.read_u16()?
            };
            let prop = match class.property_by_key(key) {
                Some(prop) => prop,
                None => {
                    error!(
                        "World::apply_properties: class {} has no property key {}, dropping the rest",
                        class_name, key
                    );
                    return Ok(());
                }
            };
            let value = schema.decode_value(prop.type_id, stream)?;

            match prop.name.as_str() {
                "position" => match vector3_of(&value) {
                    Some(pos) => self.force_position(eid, pos, events),
                    None => warn!(
                        "World::apply_properties: position of {} is not a VECTOR3",
                        eid
                    ),
                },
                "direction" => match vector3_of(&value) {
                    Some(dir) => self.force_direction(eid, dir, events),
                    None => warn!(
                        "World::apply_properties: direction of {} is not a VECTOR3",
                        eid
                    ),
                },
                _ => {
                    let announce = match self.entities.get_mut(&eid) {
                        Some(entity) => {
                            entity.set_property(prop.utype, value.clone());
                            if prop.is_base() {
                                entity.inited
                            } else {
                                entity.in_world
                            }
                        }
                        None => false,
                    };
                    if announce {
                        events.push(ClientEvent::PropertyChanged {
                            entity_id: eid,
                            name: prop.name.clone(),
                            value,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Announces every stored property once, under the same gates a live
    /// update would use. Runs after an entity is initialised so listeners
    /// can seed their views.
    fn announce_all_properties(&mut self, eid: i32, schema: &SchemaRegistry, events: &mut Events) {
        let entity = match self.entities.get(&eid) {
            Some(entity) => entity,
            None => return,
        };
        let class = match schema.class(&entity.class_name) {
            Some(class) => class,
            None => return,
        };
        let is_player = eid == self.player_id;

        let mut announce = Vec::new();
        for prop in class.properties() {
            let value = match entity.property(prop.utype) {
                Some(value) => value,
                None => continue,
            };
            let fire = if prop.is_base() {
                entity.inited && !entity.in_world
            } else if prop.is_owner_only() && !is_player {
                false
            } else {
                entity.in_world
            };
            if fire {
                announce.push((prop.name.clone(), value.clone()));
            }
        }
        for (name, value) in announce {
            events.push(ClientEvent::PropertyChanged {
                entity_id: eid,
                name,
                value,
            });
        }
    }

    // ---- client method calls ----------------------------------------

    pub fn on_remote_method_call(
        &mut self,
        stream: &mut ByteStream,
        schema: &SchemaRegistry,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;
        self.apply_method_call(eid, stream, schema, events)
    }

    pub fn on_remote_method_call_optimized(
        &mut self,
        stream: &mut ByteStream,
        schema: &SchemaRegistry,
        config: &ClientConfig,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = self.read_view_entity_id(stream, config)?;
        self.apply_method_call(eid, stream, schema, events)
    }

    fn apply_method_call(
        &mut self,
        eid: i32,
        stream: &mut ByteStream,
        schema: &SchemaRegistry,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let class_name = match self.entities.get(&eid) {
            Some(entity) => entity.class_name.clone(),
            None => {
                error!("World::apply_method_call: unknown entity {}", eid);
                return Ok(());
            }
        };
        let class = match schema.class(&class_name) {
            Some(class) => class,
            None => {
                error!("World::apply_method_call: unknown class {}", class_name);
                return Ok(());
            }
        };

        let key = if class.use_method_alias() {
            stream.read_u8()? as u16
        } else {
            stream.read_u16()?
        };
        let method = match class.client_method_by_key(key) {
            Some(method) => method,
            None => {
                error!(
                    "World::apply_method_call: class {} has no client method key {}",
                    class_name, key
                );
                return Ok(());
            }
        };

        let mut args = Vec::with_capacity(method.arg_types.len());
        for &type_id in &method.arg_types {
            args.push(schema.decode_value(type_id, stream)?);
        }

        events.push(ClientEvent::MethodCall {
            entity_id: eid,
            name: method.name.clone(),
            args,
        });
        Ok(())
    }

    // ---- world membership -------------------------------------------

    pub fn on_entity_enter_world(
        &mut self,
        stream: &mut ByteStream,
        schema: &SchemaRegistry,
        config: &ClientConfig,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;
        if self.player_id > 0 && eid != self.player_id {
            self.aoi_aliases.push(eid);
        }

        let class_id = if schema.class_count() > 255 {
            stream.read_u16()?
        } else {
            stream.read_u8()? as u16
        };
        let is_on_ground = if stream.length() > 0 {
            stream.read_i8()?
        } else {
            1
        };
        let parent_id = if stream.length() > 0 { stream.read_i32()? } else { 0 };

        if !self.entities.contains_key(&eid) {
            // A fresh entity must have announced its properties first.
            let mut queued = match self.buffered.remove(&eid) {
                Some(queued) => queued,
                None => {
                    error!(
                        "World::on_entity_enter_world: entity {} entered without its property message",
                        eid
                    );
                    return Ok(());
                }
            };
            let class = match schema.class_by_id(class_id) {
                Some(class) => class,
                None => {
                    error!(
                        "World::on_entity_enter_world: unknown class id {} for entity {}",
                        class_id, eid
                    );
                    return Ok(());
                }
            };
            let class_name = class.name().to_string();

            let mut entity = Entity::new(eid, class);
            entity.has_cell = true;
            self.entities.insert(eid, entity);

            self.on_update_properties(&mut queued, schema, events)?;

            if let Some(entity) = self.entities.get_mut(&eid) {
                entity.is_on_ground = is_on_ground > 0;
                if parent_id > 0 {
                    entity.parent_id = parent_id;
                }
            }
            if parent_id > 0 && self.entities.contains_key(&parent_id) {
                self.set_parent(eid, Some(parent_id), events);
            }

            if let Some(entity) = self.entities.get_mut(&eid) {
                entity.inited = true;
                entity.in_world = true;
            }
            events.push(ClientEvent::EntityEnterWorld {
                entity_id: eid,
                class_name,
                is_player: false,
            });
            if config.is_on_init_call_propertys_set_methods {
                self.announce_all_properties(eid, schema, events);
            }

            // Children announced before their parent pick up the link now.
            self.relink_children(eid, events);
            return Ok(());
        }

        // Already known: only the player survives out of world, anything
        // else re-entering is a protocol fault.
        if eid != self.player_id {
            error!(
                "World::on_entity_enter_world: entity {} is already in the table",
                eid
            );
            return Ok(());
        }
        let in_world = self.entities.get(&eid).map(|e| e.in_world).unwrap_or(false);
        if in_world {
            error!(
                "World::on_entity_enter_world: player {} entered the world twice",
                eid
            );
            return Ok(());
        }

        self.aoi_aliases.clear();
        self.clear_entities(false, events);

        if let Some(player) = self.entities.get_mut(&eid) {
            player.has_cell = true;
            player.is_on_ground = is_on_ground > 0;
            player.in_world = true;
        }
        events.push(ClientEvent::EntityEnterWorld {
            entity_id: eid,
            class_name: self.player_class.clone(),
            is_player: true,
        });
        if config.is_on_init_call_propertys_set_methods {
            self.announce_all_properties(eid, schema, events);
        }
        Ok(())
    }

    pub fn on_entity_leave_world(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;
        self.leave_world(eid, events);
        Ok(())
    }

    pub fn on_entity_leave_world_optimized(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = self.read_view_entity_id(stream, config)?;
        self.leave_world(eid, events);
        Ok(())
    }

    fn leave_world(&mut self, eid: i32, events: &mut Events) {
        if !self.entities.contains_key(&eid) {
            error!("World::leave_world: unknown entity {}", eid);
            return;
        }
        let is_player = eid == self.player_id;
        let in_world = self.entities.get(&eid).map(|e| e.in_world).unwrap_or(false);

        if in_world {
            events.push(ClientEvent::EntityLeaveWorld {
                entity_id: eid,
                is_player,
            });
            if let Some(entity) = self.entities.get_mut(&eid) {
                entity.in_world = false;
            }
        }

        if is_player {
            // The proxy stays; only its cell view is gone.
            self.clear_space(false, events);
            if let Some(player) = self.entities.get_mut(&eid) {
                player.has_cell = false;
            }
        } else {
            self.controlled.retain(|&id| id != eid);
            if let Some(index) = self.aoi_aliases.iter().position(|&id| id == eid) {
                // Order-preserving removal; later aliases shift down, which
                // is exactly what the server-side list does.
                self.aoi_aliases.remove(index);
            }
            self.destroy_entity(eid, events);
        }
    }

    pub fn on_entity_enter_space(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;
        self.space_id = stream.read_u32()?;
        let is_on_ground = if stream.length() > 0 {
            stream.read_i8()?
        } else {
            1
        };

        let position = match self.entities.get_mut(&eid) {
            Some(entity) => {
                entity.is_on_ground = is_on_ground > 0;
                entity.in_world = true;
                entity.position
            }
            None => {
                error!("World::on_entity_enter_space: unknown entity {}", eid);
                return Ok(());
            }
        };
        self.server_pos = position;

        events.push(ClientEvent::EntityEnterSpace {
            entity_id: eid,
            space_id: self.space_id,
            is_player: eid == self.player_id,
        });
        Ok(())
    }

    pub fn on_entity_leave_space(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;
        if !self.entities.contains_key(&eid) {
            error!("World::on_entity_leave_space: unknown entity {}", eid);
            return Ok(());
        }

        events.push(ClientEvent::EntityLeaveSpace {
            entity_id: eid,
            is_player: eid == self.player_id,
        });
        if let Some(entity) = self.entities.get_mut(&eid) {
            entity.in_world = false;
        }
        self.clear_space(false, events);
        Ok(())
    }

    pub fn on_entity_destroyed(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;
        if !self.entities.contains_key(&eid) {
            error!("World::on_entity_destroyed: unknown entity {}", eid);
            return Ok(());
        }

        let is_player = eid == self.player_id;
        let in_world = self.entities.get(&eid).map(|e| e.in_world).unwrap_or(false);
        if in_world {
            if is_player {
                self.clear_space(false, events);
            }
            events.push(ClientEvent::EntityLeaveWorld {
                entity_id: eid,
                is_player,
            });
            if let Some(entity) = self.entities.get_mut(&eid) {
                entity.in_world = false;
            }
        }

        self.controlled.retain(|&id| id != eid);
        self.destroy_entity(eid, events);
        Ok(())
    }

    // ---- space data -------------------------------------------------

    pub fn on_init_space_data(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        self.clear_space(false, events);
        self.space_id = stream.read_u32()?;

        while stream.length() > 0 {
            let key = stream.read_string()?;
            let value = stream.read_string()?;
            let space_id = self.space_id;
            self.set_space_data(space_id, key, value, events);
        }
        Ok(())
    }

    pub fn on_set_space_data(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let space_id = stream.read_u32()?;
        let key = stream.read_string()?;
        let value = stream.read_string()?;
        self.set_space_data(space_id, key, value, events);
        Ok(())
    }

    pub fn on_del_space_data(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let space_id = stream.read_u32()?;
        let key = stream.read_string()?;
        self.space_data.remove(&key);
        events.push(ClientEvent::SpaceDataChanged {
            space_id,
            key,
            value: None,
        });
        Ok(())
    }

    fn set_space_data(&mut self, space_id: u32, key: String, value: String, events: &mut Events) {
        self.space_data.insert(key.clone(), value.clone());

        if key == "_mapping" {
            self.is_loaded_geometry = true;
            self.space_id = space_id;
            self.space_res_path = value.clone();
            events.push(ClientEvent::SpaceGeometryMapping {
                space_id,
                res_path: value.clone(),
            });
        }

        events.push(ClientEvent::SpaceDataChanged {
            space_id,
            key,
            value: Some(value),
        });
    }

    // ---- transform pushes -------------------------------------------

    pub fn on_set_entity_pos_and_dir(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;
        let position = read_vec3(stream)?;
        let direction = read_vec3(stream)?;

        if !self.entities.contains_key(&eid) {
            error!("World::on_set_entity_pos_and_dir: unknown entity {}", eid);
            return Ok(());
        }
        self.force_position(eid, position, events);
        self.force_direction(eid, direction, events);
        Ok(())
    }

    pub fn on_update_base_pos(&mut self, stream: &mut ByteStream) -> Result<(), WorldError> {
        let position = read_vec3(stream)?;
        self.update_base_pos(position);
        Ok(())
    }

    pub fn on_update_base_pos_xz(&mut self, stream: &mut ByteStream) -> Result<(), WorldError> {
        let x = stream.read_f32()?;
        let z = stream.read_f32()?;
        let y = self.server_pos.y;
        self.update_base_pos(Vec3::new(x, y, z));
        Ok(())
    }

    fn update_base_pos(&mut self, position: Vec3) {
        self.server_pos = position;

        let eid = self.player_id;
        let controlled = self
            .entities
            .get(&eid)
            .map(|e| e.is_controlled)
            .unwrap_or(false);
        if !controlled {
            return;
        }

        // Server-steered player: the base position is authoritative.
        let parent = self.attached_parent_frame(eid);
        if let Some(player) = self.entities.get_mut(&eid) {
            player.position = position;
            player.local_position = match parent {
                Some((parent_pos, parent_dir)) => {
                    math::position_world_to_local(parent_pos, parent_dir, position)
                }
                None => position,
            };
        }
        self.sync_children(eid, true);
    }

    pub fn on_update_base_dir(&mut self, stream: &mut ByteStream) -> Result<(), WorldError> {
        let direction = read_vec3(stream)?;

        let eid = self.player_id;
        let controlled = self
            .entities
            .get(&eid)
            .map(|e| e.is_controlled)
            .unwrap_or(false);
        if !controlled {
            return Ok(());
        }

        let parent = self.attached_parent_frame(eid);
        if let Some(player) = self.entities.get_mut(&eid) {
            player.direction = direction;
            player.local_direction = match parent {
                Some((_, parent_dir)) => math::direction_world_to_local(parent_dir, direction),
                None => direction,
            };
        }
        self.sync_children(eid, false);
        Ok(())
    }

    // ---- volatile updates -------------------------------------------

    pub fn on_update_data(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        let eid = self.read_view_entity_id(stream, config)?;
        if !self.entities.contains_key(&eid) {
            error!("World::on_update_data: unknown entity {}", eid);
        }
        Ok(())
    }

    pub fn on_update_data_ypr(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::None, true, true, true)
    }

    pub fn on_update_data_yp(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::None, true, true, false)
    }

    pub fn on_update_data_yr(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::None, true, false, true)
    }

    pub fn on_update_data_pr(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::None, false, true, true)
    }

    pub fn on_update_data_y(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::None, true, false, false)
    }

    pub fn on_update_data_p(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::None, false, true, false)
    }

    pub fn on_update_data_r(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::None, false, false, true)
    }

    pub fn on_update_data_xz(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xz, false, false, false)
    }

    pub fn on_update_data_xz_ypr(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xz, true, true, true)
    }

    pub fn on_update_data_xz_yp(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xz, true, true, false)
    }

    pub fn on_update_data_xz_yr(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xz, true, false, true)
    }

    pub fn on_update_data_xz_pr(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xz, false, true, true)
    }

    pub fn on_update_data_xz_y(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xz, true, false, false)
    }

    pub fn on_update_data_xz_p(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xz, false, true, false)
    }

    pub fn on_update_data_xz_r(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xz, false, false, true)
    }

    pub fn on_update_data_xyz(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xyz, false, false, false)
    }

    pub fn on_update_data_xyz_ypr(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xyz, true, true, true)
    }

    pub fn on_update_data_xyz_yp(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xyz, true, true, false)
    }

    pub fn on_update_data_xyz_yr(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xyz, true, false, true)
    }

    pub fn on_update_data_xyz_pr(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xyz, false, true, true)
    }

    pub fn on_update_data_xyz_y(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xyz, true, false, false)
    }

    pub fn on_update_data_xyz_p(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xyz, false, true, false)
    }

    pub fn on_update_data_xyz_r(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<(), WorldError> {
        self.update_volatile(stream, config, PosForm::Xyz, false, false, true)
    }

    fn update_volatile(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
        pos_form: PosForm,
        has_yaw: bool,
        has_pitch: bool,
        has_roll: bool,
    ) -> Result<(), WorldError> {
        let eid = self.read_view_entity_id(stream, config)?;

        let (x, y, z, on_ground) = match pos_form {
            PosForm::None => (FLT_MAX, FLT_MAX, FLT_MAX, -1i8),
            PosForm::Xz => {
                let (x, z) = stream.read_pack_xz()?;
                (x, FLT_MAX, z, 1)
            }
            PosForm::Xyz => {
                let (x, z) = stream.read_pack_xz()?;
                let y = stream.read_pack_y()?;
                (x, y, z, 0)
            }
        };

        let yaw = if has_yaw {
            math::int8_to_angle(stream.read_i8()?, false)
        } else {
            FLT_MAX
        };
        let pitch = if has_pitch {
            math::int8_to_angle(stream.read_i8()?, false)
        } else {
            FLT_MAX
        };
        let roll = if has_roll {
            math::int8_to_angle(stream.read_i8()?, false)
        } else {
            FLT_MAX
        };

        self.apply_volatile(
            eid,
            Vec3::new(x, y, z),
            Vec3::new(roll, pitch, yaw),
            on_ground,
        );
        Ok(())
    }

    fn apply_volatile(&mut self, eid: i32, pos: Vec3, dir: Vec3, on_ground: i8) {
        let (local_direction, parent_id) = match self.entities.get(&eid) {
            Some(entity) => (entity.local_direction, entity.parent_id),
            None => {
                error!("World::apply_volatile: unknown entity {}", eid);
                return;
            }
        };

        if on_ground >= 0 {
            if let Some(entity) = self.entities.get_mut(&eid) {
                entity.is_on_ground = on_ground > 0;
            }
        }

        let parent_frame = if parent_id > 0 {
            self.entities
                .get(&parent_id)
                .map(|parent| (parent.position, parent.direction))
        } else {
            None
        };

        // Angles land in the local frame first; only an attached parent
        // promotes them to world space.
        let mut direction = local_direction;
        let mut change_direction = false;
        if dir.x != FLT_MAX {
            direction.x = dir.x;
            change_direction = true;
        }
        if dir.y != FLT_MAX {
            direction.y = dir.y;
            change_direction = true;
        }
        if dir.z != FLT_MAX {
            direction.z = dir.z;
            change_direction = true;
        }

        let mut done = false;
        if change_direction {
            if let Some(entity) = self.entities.get_mut(&eid) {
                entity.local_direction = direction;
            }
            if parent_id > 0 {
                match parent_frame {
                    Some((_, parent_dir)) => {
                        direction = math::direction_local_to_world(parent_dir, direction);
                    }
                    None => change_direction = false,
                }
            }
            if change_direction {
                if let Some(entity) = self.entities.get_mut(&eid) {
                    entity.direction = direction;
                }
                done = true;
            }
        }

        let mut position_changed = pos.x != FLT_MAX || pos.y != FLT_MAX || pos.z != FLT_MAX;
        let mut position = Vec3::new(
            if pos.x == FLT_MAX { 0.0 } else { pos.x },
            if pos.y == FLT_MAX { 0.0 } else { pos.y },
            if pos.z == FLT_MAX { 0.0 } else { pos.z },
        );
        if position_changed {
            if parent_id > 0 {
                if let Some(entity) = self.entities.get_mut(&eid) {
                    entity.local_position = position;
                }
                match parent_frame {
                    Some((parent_pos, parent_dir)) => {
                        position = math::position_local_to_world(parent_pos, parent_dir, position);
                    }
                    None => position_changed = false,
                }
            } else {
                position = position + self.server_pos;
                if let Some(entity) = self.entities.get_mut(&eid) {
                    entity.local_position = position;
                }
            }
            if position_changed {
                if let Some(entity) = self.entities.get_mut(&eid) {
                    entity.position = position;
                }
                done = true;
            }
        }

        if done {
            self.sync_children(eid, !change_direction);
        }
    }

    // ---- control and parenting --------------------------------------

    pub fn on_control_entity(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;
        let is_controlled = stream.read_i8()? != 0;

        if !self.entities.contains_key(&eid) {
            error!("World::on_control_entity: unknown entity {}", eid);
            return Ok(());
        }

        if is_controlled {
            if eid != self.player_id {
                self.controlled.push(eid);
            }
        } else {
            self.controlled.retain(|&id| id != eid);
        }
        if let Some(entity) = self.entities.get_mut(&eid) {
            entity.is_controlled = is_controlled;
        }

        events.push(ClientEvent::ControlledChanged {
            entity_id: eid,
            is_controlled,
        });
        Ok(())
    }

    pub fn on_parent_changed(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let eid = stream.read_i32()?;
        let parent_id = stream.read_i32()?;

        if !self.entities.contains_key(&eid) {
            error!("World::on_parent_changed: unknown entity {}", eid);
            return Ok(());
        }

        if parent_id <= 0 {
            self.set_parent(eid, None, events);
        } else if self.entities.contains_key(&parent_id) {
            self.set_parent(eid, Some(parent_id), events);
        } else if let Some(entity) = self.entities.get_mut(&eid) {
            // Parent not in view yet; remember the id and link up when it
            // enters the world.
            entity.parent_id = parent_id;
        }
        Ok(())
    }

    // ---- download streams -------------------------------------------

    pub fn on_stream_data_started(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let id = stream.read_i16()? as u16;
        let data_size = stream.read_u32()?;
        let descr = stream.read_string()?;
        events.push(ClientEvent::StreamDataStarted {
            id,
            data_size,
            descr,
        });
        Ok(())
    }

    pub fn on_stream_data_recv(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let id = stream.read_i16()? as u16;
        let data = stream.read_blob()?;
        events.push(ClientEvent::StreamDataRecv { id, data });
        Ok(())
    }

    pub fn on_stream_data_completed(
        &mut self,
        stream: &mut ByteStream,
        events: &mut Events,
    ) -> Result<(), WorldError> {
        let id = stream.read_i16()? as u16;
        events.push(ClientEvent::StreamDataCompleted { id });
        Ok(())
    }

    // ---- gameplay-side setters --------------------------------------

    /// Moves an entity from gameplay code. The next sync window reports the
    /// change to the server if it exceeds [`MOVE_EPSILON`].
    pub fn update_entity_transform(&mut self, eid: i32, position: Vec3, direction: Vec3) {
        let parent = self.attached_parent_frame(eid);
        let (position_changed, direction_changed) = match self.entities.get_mut(&eid) {
            Some(entity) => {
                let position_changed = entity.position.distance(position) > SET_EPSILON;
                let direction_changed = entity.direction.distance(direction) > SET_EPSILON;
                if position_changed {
                    entity.position = position;
                    entity.local_position = match parent {
                        Some((parent_pos, parent_dir)) => {
                            math::position_world_to_local(parent_pos, parent_dir, position)
                        }
                        None => position,
                    };
                }
                if direction_changed {
                    entity.direction = direction;
                    entity.local_direction = match parent {
                        Some((_, parent_dir)) => {
                            math::direction_world_to_local(parent_dir, direction)
                        }
                        None => direction,
                    };
                }
                (position_changed, direction_changed)
            }
            None => return,
        };

        if direction_changed {
            self.sync_children(eid, false);
        } else if position_changed {
            self.sync_children(eid, true);
        }
    }

    // ---- outbound transform sync ------------------------------------

    /// Reports player (and client-controlled entity) movement upstream,
    /// at most once per [`SYNC_INTERVAL`].
    pub fn update_player_to_server(
        &mut self,
        catalog: &MessageCatalog,
        config: &ClientConfig,
        sink: &mut dyn SegmentSink,
    ) {
        if !config.sync_player || self.space_id == 0 {
            return;
        }

        let now = Instant::now();
        let span = now.duration_since(self.last_sync_time);
        if span < SYNC_INTERVAL {
            return;
        }
        // Carry the overshoot so the cadence holds at ten per second.
        self.last_sync_time = now - (span - SYNC_INTERVAL);

        let player_in_world = self
            .entities
            .get(&self.player_id)
            .map(|e| e.in_world)
            .unwrap_or(false);
        if !player_in_world {
            return;
        }

        let player_controlled = self
            .entities
            .get(&self.player_id)
            .map(|e| e.is_controlled)
            .unwrap_or(false);
        if !player_controlled {
            self.sync_entity_transform(self.player_id, catalog, sink, false);
        }

        let controlled = self.controlled.clone();
        for eid in controlled {
            self.sync_entity_transform(eid, catalog, sink, true);
        }
    }

    fn sync_entity_transform(
        &mut self,
        eid: i32,
        catalog: &MessageCatalog,
        sink: &mut dyn SegmentSink,
        controlled: bool,
    ) {
        let parent_attached = self
            .entities
            .get(&eid)
            .map(|e| e.parent_attached)
            .unwrap_or(false);
        if parent_attached {
            self.sync_parented(eid, catalog, sink, controlled);
        } else {
            self.sync_unparented(eid, catalog, sink, controlled);
        }
    }

    fn sync_parented(
        &mut self,
        eid: i32,
        catalog: &MessageCatalog,
        sink: &mut dyn SegmentSink,
        controlled: bool,
    ) {
        let (parent_id, local_position, position, direction, is_on_ground) =
            match self.entities.get_mut(&eid) {
                Some(entity) => {
                    let changed = entity.local_position.distance(entity.last_sync_local_pos)
                        > MOVE_EPSILON
                        || entity.local_direction.distance(entity.last_sync_local_dir)
                            > MOVE_EPSILON;
                    if !Self::consume_sync_budget(entity, changed) {
                        return;
                    }
                    entity.last_sync_local_pos = entity.local_position;
                    entity.last_sync_local_dir = entity.local_direction;
                    entity.last_sync_pos = entity.position;
                    entity.last_sync_dir = entity.direction;
                    (
                        entity.parent_id,
                        entity.local_position,
                        entity.position,
                        entity.direction,
                        entity.is_on_ground,
                    )
                }
                None => return,
            };

        let name = if controlled {
            "Baseapp_onUpdateDataFromClientForControlledEntityOnParent"
        } else {
            "Baseapp_onUpdateDataFromClientOnParent"
        };
        let msg = match catalog.get(name) {
            Some(msg) => msg,
            None => return,
        };

        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        if controlled {
            bundle.write_i32(eid);
        }
        bundle.write_i32(parent_id);
        write_vec3(&mut bundle, local_position);
        write_vec3(&mut bundle, position);
        write_vec3(&mut bundle, direction);
        bundle.write_u8(u8::from(is_on_ground));
        bundle.write_u32(self.space_id);
        if bundle.send(sink).is_err() {
            debug!("World::sync_parented: transform update dropped, link is closing");
        }
    }

    fn sync_unparented(
        &mut self,
        eid: i32,
        catalog: &MessageCatalog,
        sink: &mut dyn SegmentSink,
        controlled: bool,
    ) {
        let (position, direction, is_on_ground) = match self.entities.get_mut(&eid) {
            Some(entity) => {
                let changed = entity.position.distance(entity.last_sync_pos) > MOVE_EPSILON
                    || entity.direction.distance(entity.last_sync_dir) > MOVE_EPSILON;
                if !Self::consume_sync_budget(entity, changed) {
                    return;
                }
                entity.last_sync_pos = entity.position;
                entity.last_sync_dir = entity.direction;
                (entity.position, entity.direction, entity.is_on_ground)
            }
            None => return,
        };

        let name = if controlled {
            "Baseapp_onUpdateDataFromClientForControlledEntity"
        } else {
            "Baseapp_onUpdateDataFromClient"
        };
        let msg = match catalog.get(name) {
            Some(msg) => msg,
            None => return,
        };

        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        if controlled {
            bundle.write_i32(eid);
        }
        write_vec3(&mut bundle, position);
        write_vec3(&mut bundle, direction);
        bundle.write_u8(u8::from(is_on_ground));
        bundle.write_u32(self.space_id);
        if bundle.send(sink).is_err() {
            debug!("World::sync_unparented: transform update dropped, link is closing");
        }
    }

    /// A transform that moved refills the entity's extra-send budget; a
    /// quiet one burns it down. Quiet entities stop syncing once the
    /// budget is spent, so the last movement still gets its settling
    /// updates without ticking forever.
    fn consume_sync_budget(entity: &mut Entity, changed: bool) -> bool {
        if changed {
            entity.extra_sync_budget = EXTRA_SYNC_BUDGET;
            true
        } else if entity.extra_sync_budget > 0 {
            entity.extra_sync_budget -= 1;
            true
        } else {
            false
        }
    }

    // ---- internals --------------------------------------------------

    /// Resolves the entity id of a compact message. Wide streams carry a
    /// full i32; narrow ones a one-byte index into the view alias list.
    /// A stale narrow alias resolves to the 0 sentinel.
    fn read_view_entity_id(
        &self,
        stream: &mut ByteStream,
        config: &ClientConfig,
    ) -> Result<i32, StreamError> {
        if !config.use_alias_entity_id || self.aoi_aliases.len() > 255 {
            return stream.read_i32();
        }
        let alias = stream.read_u8()? as usize;
        if self.aoi_aliases.len() <= alias {
            return Ok(0);
        }
        Ok(self.aoi_aliases[alias])
    }

    fn force_position(&mut self, eid: i32, position: Vec3, events: &mut Events) {
        let parent = self.attached_parent_frame(eid);
        match self.entities.get_mut(&eid) {
            Some(entity) => {
                entity.position = position;
                entity.last_sync_pos = position;
                entity.local_position = match parent {
                    Some((parent_pos, parent_dir)) => {
                        math::position_world_to_local(parent_pos, parent_dir, position)
                    }
                    None => position,
                };
            }
            None => return,
        }
        if eid == self.player_id {
            self.server_pos = position;
        }
        self.sync_children(eid, true);
        events.push(ClientEvent::PositionForced {
            entity_id: eid,
            position,
        });
    }

    fn force_direction(&mut self, eid: i32, direction: Vec3, events: &mut Events) {
        let parent = self.attached_parent_frame(eid);
        match self.entities.get_mut(&eid) {
            Some(entity) => {
                entity.direction = direction;
                entity.last_sync_dir = direction;
                entity.local_direction = match parent {
                    Some((_, parent_dir)) => math::direction_world_to_local(parent_dir, direction),
                    None => direction,
                };
            }
            None => return,
        }
        self.sync_children(eid, false);
        events.push(ClientEvent::DirectionForced {
            entity_id: eid,
            direction,
        });
    }

    fn attached_parent_frame(&self, eid: i32) -> Option<(Vec3, Vec3)> {
        let entity = self.entities.get(&eid)?;
        if !entity.parent_attached {
            return None;
        }
        let parent = self.entities.get(&entity.parent_id)?;
        Some((parent.position, parent.direction))
    }

    /// Re-derives the world transform of every attached child from the
    /// parent's current frame. Not recursive. The derived values are also
    /// copied into the children's last-sync slots so a parent move alone
    /// does not count as child movement.
    fn sync_children(&mut self, parent_id: i32, position_only: bool) {
        let (parent_pos, parent_dir, child_ids) = match self.entities.get(&parent_id) {
            Some(parent) => (parent.position, parent.direction, parent.child_ids.clone()),
            None => return,
        };

        for child_id in child_ids {
            if let Some(child) = self.entities.get_mut(&child_id) {
                child.position =
                    math::position_local_to_world(parent_pos, parent_dir, child.local_position);
                child.last_sync_pos = child.position;
                if !position_only {
                    child.direction =
                        math::direction_local_to_world(parent_dir, child.local_direction);
                    child.last_sync_dir = child.direction;
                }
            }
        }
    }

    fn set_parent(&mut self, child_id: i32, new_parent: Option<i32>, events: &mut Events) {
        let (attached, current_parent) = match self.entities.get(&child_id) {
            Some(child) => (child.parent_attached, child.parent_id),
            None => return,
        };
        match new_parent {
            Some(parent_id) if attached && current_parent == parent_id => return,
            None if !attached => return,
            _ => {}
        }

        match new_parent {
            Some(parent_id) => {
                let frame = match self.entities.get(&parent_id) {
                    Some(parent) => (parent.position, parent.direction),
                    None => return,
                };
                if attached {
                    if let Some(old) = self.entities.get_mut(&current_parent) {
                        old.child_ids.retain(|&id| id != child_id);
                    }
                }
                if let Some(parent) = self.entities.get_mut(&parent_id) {
                    parent.child_ids.push(child_id);
                }
                let announce = match self.entities.get_mut(&child_id) {
                    Some(child) => {
                        child.parent_attached = true;
                        child.parent_id = parent_id;
                        child.local_position =
                            math::position_world_to_local(frame.0, frame.1, child.position);
                        child.local_direction =
                            math::direction_world_to_local(frame.1, child.direction);
                        child.in_world
                    }
                    None => false,
                };
                if announce {
                    events.push(ClientEvent::GotParent {
                        entity_id: child_id,
                        parent_id,
                    });
                }
            }
            None => {
                if let Some(old) = self.entities.get_mut(&current_parent) {
                    old.child_ids.retain(|&id| id != child_id);
                }
                let announce = match self.entities.get_mut(&child_id) {
                    Some(child) => {
                        child.parent_attached = false;
                        child.parent_id = 0;
                        // Local frame promotes to world on detach.
                        child.local_position = child.position;
                        child.local_direction = child.direction;
                        child.in_world
                    }
                    None => false,
                };
                if announce {
                    events.push(ClientEvent::LostParent {
                        entity_id: child_id,
                    });
                }
            }
        }
    }

    /// Attaches every entity that announced `parent_id` as its parent
    /// before the parent itself entered the world.
    fn relink_children(&mut self, parent_id: i32, events: &mut Events) {
        let mut waiting: Vec<i32> = self
            .entities
            .values()
            .filter(|e| e.parent_id == parent_id && !e.parent_attached && e.id != parent_id)
            .map(|e| e.id)
            .collect();
        waiting.sort_unstable();

        for child_id in waiting {
            self.set_parent(child_id, Some(parent_id), events);
        }
    }

    /// Removes the entity from the table. Attached children keep their
    /// announced parent id but lose the live link; the entity detaches
    /// from its own parent's child list.
    fn destroy_entity(&mut self, eid: i32, events: &mut Events) {
        let entity = match self.entities.remove(&eid) {
            Some(entity) => entity,
            None => return,
        };

        for child_id in &entity.child_ids {
            if let Some(child) = self.entities.get_mut(child_id) {
                child.parent_attached = false;
            }
        }
        if entity.parent_attached {
            if let Some(parent) = self.entities.get_mut(&entity.parent_id) {
                parent.child_ids.retain(|&id| id != eid);
            }
        }

        events.push(ClientEvent::EntityDestroyed { entity_id: eid });
    }

    /// Destroys entities and empties the controlled list. With `is_all`
    /// false the player survives; without a player nothing is touched.
    pub(crate) fn clear_entities(&mut self, is_all: bool, events: &mut Events) {
        self.controlled.clear();

        let mut doomed: Vec<i32> = if is_all {
            self.entities.keys().copied().collect()
        } else {
            if self.player_id == 0 || !self.entities.contains_key(&self.player_id) {
                return;
            }
            self.entities
                .keys()
                .copied()
                .filter(|&id| id != self.player_id)
                .collect()
        };
        doomed.sort_unstable();

        for eid in doomed {
            let is_player = eid == self.player_id;
            let in_world = self.entities.get(&eid).map(|e| e.in_world).unwrap_or(false);
            if in_world {
                events.push(ClientEvent::EntityLeaveWorld {
                    entity_id: eid,
                    is_player,
                });
                if let Some(entity) = self.entities.get_mut(&eid) {
                    entity.in_world = false;
                }
            }
            self.destroy_entity(eid, events);
        }
    }

    fn clear_space(&mut self, is_all: bool, events: &mut Events) {
        self.aoi_aliases.clear();
        self.space_data.clear();
        self.clear_entities(is_all, events);
        self.is_loaded_geometry = false;
        self.space_id = 0;
    }

    #[cfg(test)]
    fn backdate_sync_timer(&mut self) {
        self.last_sync_time = self.last_sync_time - SYNC_INTERVAL;
    }

    #[cfg(test)]
    fn view_aliases(&self) -> &[i32] {
        &self.aoi_aliases
    }
}

#[derive(Clone, Copy)]
enum PosForm {
    None,
    Xz,
    Xyz,
}

fn read_vec3(stream: &mut ByteStream) -> Result<Vec3, StreamError> {
    Ok(Vec3::new(
        stream.read_f32()?,
        stream.read_f32()?,
        stream.read_f32()?,
    ))
}

fn write_vec3(bundle: &mut Bundle, v: Vec3) {
    bundle.write_f32(v.x);
    bundle.write_f32(v.y);
    bundle.write_f32(v.z);
}

fn vector3_of(value: &Value) -> Option<Vec3> {
    match value {
        Value::Vector3([x, y, z]) => Some(Vec3::new(*x, *y, *z)),
        _ => None,
    }
}
