//! Gateway session.
//!
//! Owns the link to the gateway server, over TCP or KCP depending on what
//! the login step negotiated. Runs the hello and protocol import chain
//! (message table and entity schema restore independently, each with its
//! own wire fallback), then routes entity traffic into [`crate::world`]
//! and account traffic out as [`GatewaySignal`]s. Once per pump it also
//! flushes the player's own movement back to the server.

use log::{debug, error, warn};

use thiserror::Error;

use kbe_shared::{
    Bundle, ByteStream, Frame, MessageCatalog, MessageDescriptor, MethodDef, SchemaError,
    SchemaRegistry, SendError, ServerApp, StreamError, Value,
};

use crate::cache::BlobCache;
use crate::config::ClientConfig;
use crate::events::Events;
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::transport::{KcpTransport, TcpTransport, Transport, TransportSignal};
use crate::world::{World, WorldError};

/// What one `process()` of the gateway session produced.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewaySignal {
    /// The connect failed; no handshake took place.
    ConnectFailed,
    /// Handshake done, message table and entity schema both imported.
    Ready,
    VersionMismatch { server_version: String },
    ScriptVersionMismatch { server_version: String },
    LoginFailed { code: u16 },
    ReloginOk,
    ReloginFailed { code: u16 },
    EmailBound { code: u16 },
    PasswordChanged { code: u16 },
    Kicked { code: u16 },
    /// The link died: socket error, unreadable stream, or tick timeout.
    /// The world has already been torn down when this surfaces.
    Lost,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    World(#[from] WorldError),
}

/// Why an outbound entity method call was refused before it hit the wire.
#[derive(Debug, Error)]
pub enum RemoteCallError {
    #[error("no gateway connection")]
    NoNetwork,
    #[error("unknown entity {id}")]
    UnknownEntity { id: i32 },
    #[error("entity {id} has no cell part")]
    NoCell { id: i32 },
    #[error("entity {id} has no base part")]
    NoBase { id: i32 },
    #[error("entity class {class} is not in the schema")]
    UnknownClass { class: String },
    #[error("{class} declares no method {method}")]
    UnknownMethod { class: String, method: String },
    #[error("{method} takes {expected} arguments, got {got}")]
    ArityMismatch {
        method: String,
        expected: usize,
        got: usize,
    },
    #[error("{method} argument {index} has the wrong type")]
    ArgType { method: String, index: usize },
    #[error("message {name} is not declared by the server")]
    MissingMessage { name: String },
    #[error(transparent)]
    Encode(#[from] SchemaError),
    #[error(transparent)]
    Send(#[from] SendError),
}

pub struct GatewaySession {
    transport: Box<dyn Transport>,
    heartbeat: Heartbeat,
    frames: Vec<Frame>,
    uses_udp: bool,
}

impl GatewaySession {
    pub fn new(config: &ClientConfig) -> GatewaySession {
        GatewaySession {
            transport: Box::new(TcpTransport::new(
                config.tcp_recv_buffer_max,
                config.tcp_send_buffer_max,
            )),
            heartbeat: Heartbeat::new(config.server_heartbeat_tick),
            frames: Vec::new(),
            uses_udp: false,
        }
    }

    /// Starts a background connect, over KCP when the server offered a UDP
    /// port and the config allows it, over TCP otherwise.
    pub fn connect(&mut self, config: &ClientConfig, host: &str, tcp_port: u16, udp_port: u16) {
        self.uses_udp = !config.force_disable_udp && udp_port != 0;
        if self.uses_udp {
            let mut kcp = KcpTransport::new(
                config.tcp_recv_buffer_max,
                config.udp_send_buffer_max,
                config.udp_recv_buffer_max,
            );
            kcp.connect(host, udp_port);
            self.transport = Box::new(kcp);
        } else {
            let mut tcp =
                TcpTransport::new(config.tcp_recv_buffer_max, config.tcp_send_buffer_max);
            tcp.connect(host, tcp_port);
            self.transport = Box::new(tcp);
        }
    }

    pub fn uses_udp(&self) -> bool {
        self.uses_udp
    }

    pub fn valid(&self) -> bool {
        self.transport.valid()
    }

    /// Deliberate teardown. Never produces a `Lost` signal.
    pub fn close(&mut self) {
        self.transport.close();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        catalog: &mut MessageCatalog,
        schema: &mut SchemaRegistry,
        world: &mut World,
        mut cache: Option<&mut BlobCache>,
        config: &ClientConfig,
        events: &mut Events,
        signals: &mut Vec<GatewaySignal>,
    ) {
        match self.transport.process(catalog, &mut self.frames) {
            TransportSignal::ConnectDone { success: true } => {
                self.heartbeat.reset();
                if self.send_hello(catalog, config).is_err() {
                    error!("sending hello to the gateway failed");
                }
            }
            TransportSignal::ConnectDone { success: false } => {
                signals.push(GatewaySignal::ConnectFailed);
            }
            TransportSignal::ConnectionLost => {
                self.frames.clear();
                world.clear_entities(true, events);
                signals.push(GatewaySignal::Lost);
                return;
            }
            TransportSignal::Idle => {}
        }

        let mut frames = std::mem::take(&mut self.frames);
        for frame in frames.drain(..) {
            // A handler may tear the link down mid-batch; the rest of the
            // batch dies with it.
            if !self.transport.valid() {
                break;
            }
            let name = match catalog.client_message(frame.id) {
                Some(msg) => msg.name.clone(),
                None => {
                    warn!("gateway sent unknown message id {}", frame.id);
                    continue;
                }
            };
            let mut body = frame.body;
            let handled = self.dispatch_frame(
                &name,
                &mut body,
                catalog,
                schema,
                world,
                cache.as_deref_mut(),
                config,
                events,
                signals,
            );
            if let Err(err) = handled {
                error!("handling {} from the gateway failed: {}", name, err);
                self.transport.will_close();
            }
        }
        self.frames = frames;

        if self.transport.valid() {
            world.update_player_to_server(catalog, config, &mut self.transport);
            self.tick(catalog, world, events, signals);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_frame(
        &mut self,
        name: &str,
        body: &mut ByteStream,
        catalog: &mut MessageCatalog,
        schema: &mut SchemaRegistry,
        world: &mut World,
        cache: Option<&mut BlobCache>,
        config: &ClientConfig,
        events: &mut Events,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        match name {
            "Client_onHelloCB" => self.on_hello_cb(body, catalog, schema, cache, signals)?,
            "Client_onVersionNotMatch" => {
                self.on_version_not_match(body, config, cache, signals)?
            }
            "Client_onScriptVersionNotMatch" => {
                self.on_script_version_not_match(body, config, cache, signals)?
            }
            "Client_onImportClientMessages" => {
                self.on_import_client_messages(body, catalog, schema, cache, signals)?
            }
            "Client_onImportClientEntityDef" => {
                self.on_import_client_entity_def(body, catalog, schema, cache, signals)?
            }
            "Client_onLoginBaseappFailed" => self.on_login_baseapp_failed(body, signals)?,
            "Client_onReloginBaseappFailed" => self.on_relogin_baseapp_failed(body, signals)?,
            "Client_onReloginBaseappSuccessfully" => {
                self.on_relogin_baseapp_successfully(body, world, signals)?
            }
            "Client_onReqAccountBindEmailCB" => self.on_bind_email_cb(body, signals)?,
            "Client_onReqAccountNewPasswordCB" => self.on_new_password_cb(body, signals)?,
            "Client_onKicked" => self.on_kicked(body, signals)?,
            "Client_onAppActiveTickCB" => self.heartbeat.on_reply(),

            "Client_onCreatedProxies" => world.on_created_proxies(body, schema, config, events)?,
            "Client_onUpdatePropertysOptimized" => {
                world.on_update_properties_optimized(body, schema, config, events)?
            }
            "Client_onUpdatePropertys" => world.on_update_properties(body, schema, events)?,
            "Client_onRemoteMethodCallOptimized" => {
                world.on_remote_method_call_optimized(body, schema, config, events)?
            }
            "Client_onRemoteMethodCall" => world.on_remote_method_call(body, schema, events)?,
            "Client_onEntityEnterWorld" => {
                world.on_entity_enter_world(body, schema, config, events)?
            }
            "Client_onEntityLeaveWorldOptimized" => {
                world.on_entity_leave_world_optimized(body, config, events)?
            }
            "Client_onEntityLeaveWorld" => world.on_entity_leave_world(body, events)?,
            "Client_onEntityEnterSpace" => world.on_entity_enter_space(body, events)?,
            "Client_onEntityLeaveSpace" => world.on_entity_leave_space(body, events)?,
            "Client_onEntityDestroyed" => world.on_entity_destroyed(body, events)?,
            "Client_initSpaceData" => world.on_init_space_data(body, events)?,
            "Client_setSpaceData" => world.on_set_space_data(body, events)?,
            "Client_delSpaceData" => world.on_del_space_data(body, events)?,
            "Client_onSetEntityPosAndDir" => world.on_set_entity_pos_and_dir(body, events)?,
            "Client_onControlEntity" => world.on_control_entity(body, events)?,
            "Client_onParentChanged" => world.on_parent_changed(body, events)?,
            "Client_onUpdateBasePos" => world.on_update_base_pos(body)?,
            "Client_onUpdateBasePosXZ" => world.on_update_base_pos_xz(body)?,
            "Client_onUpdateBaseDir" => world.on_update_base_dir(body)?,

            "Client_onUpdateData" => world.on_update_data(body, config)?,
            "Client_onUpdateData_ypr" => world.on_update_data_ypr(body, config)?,
            "Client_onUpdateData_yp" => world.on_update_data_yp(body, config)?,
            "Client_onUpdateData_yr" => world.on_update_data_yr(body, config)?,
            "Client_onUpdateData_pr" => world.on_update_data_pr(body, config)?,
            "Client_onUpdateData_y" => world.on_update_data_y(body, config)?,
            "Client_onUpdateData_p" => world.on_update_data_p(body, config)?,
            "Client_onUpdateData_r" => world.on_update_data_r(body, config)?,
            "Client_onUpdateData_xz" => world.on_update_data_xz(body, config)?,
            "Client_onUpdateData_xz_ypr" => world.on_update_data_xz_ypr(body, config)?,
            "Client_onUpdateData_xz_yp" => world.on_update_data_xz_yp(body, config)?,
            "Client_onUpdateData_xz_yr" => world.on_update_data_xz_yr(body, config)?,
            "Client_onUpdateData_xz_pr" => world.on_update_data_xz_pr(body, config)?,
            "Client_onUpdateData_xz_y" => world.on_update_data_xz_y(body, config)?,
            "Client_onUpdateData_xz_p" => world.on_update_data_xz_p(body, config)?,
            "Client_onUpdateData_xz_r" => world.on_update_data_xz_r(body, config)?,
            "Client_onUpdateData_xyz" => world.on_update_data_xyz(body, config)?,
            "Client_onUpdateData_xyz_ypr" => world.on_update_data_xyz_ypr(body, config)?,
            "Client_onUpdateData_xyz_yp" => world.on_update_data_xyz_yp(body, config)?,
            "Client_onUpdateData_xyz_yr" => world.on_update_data_xyz_yr(body, config)?,
            "Client_onUpdateData_xyz_pr" => world.on_update_data_xyz_pr(body, config)?,
            "Client_onUpdateData_xyz_y" => world.on_update_data_xyz_y(body, config)?,
            "Client_onUpdateData_xyz_p" => world.on_update_data_xyz_p(body, config)?,
            "Client_onUpdateData_xyz_r" => world.on_update_data_xyz_r(body, config)?,

            "Client_onStreamDataStarted" => world.on_stream_data_started(body, events)?,
            "Client_onStreamDataRecv" => world.on_stream_data_recv(body, events)?,
            "Client_onStreamDataCompleted" => world.on_stream_data_completed(body, events)?,

            _ => error!("GatewaySession::process: unhandled message {}", name),
        }
        Ok(())
    }

    // ---- requests ---------------------------------------------------

    fn send_hello(
        &mut self,
        catalog: &MessageCatalog,
        config: &ClientConfig,
    ) -> Result<(), SendError> {
        let msg = catalog.get("Baseapp_hello").ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.write_string(&config.client_version);
        bundle.write_string(&config.client_script_version);
        bundle.write_blob(&config.network_encrypted_key);
        bundle.send(&mut self.transport)
    }

    pub fn login(
        &mut self,
        catalog: &MessageCatalog,
        account: &str,
        password: &str,
    ) -> Result<(), SendError> {
        let msg = catalog.get("Baseapp_loginBaseapp").ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.write_string(account);
        bundle.write_string(password);
        bundle.send(&mut self.transport)
    }

    /// Re-binds this link to a proxy the server kept alive across the
    /// drop. Only meaningful on the connection that lost it.
    pub fn relogin(
        &mut self,
        catalog: &MessageCatalog,
        account: &str,
        password: &str,
        player_uuid: u64,
        player_id: i32,
    ) -> Result<(), SendError> {
        let msg = catalog.get("Baseapp_reloginBaseapp").ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.write_string(account);
        bundle.write_string(password);
        bundle.write_u64(player_uuid);
        bundle.write_i32(player_id);
        bundle.send(&mut self.transport)
    }

    pub fn bind_account_email(
        &mut self,
        catalog: &MessageCatalog,
        player_id: i32,
        password: &str,
        email: &str,
    ) -> Result<(), SendError> {
        let msg = catalog.get("Baseapp_reqAccountBindEmail").ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.write_i32(player_id);
        bundle.write_string(password);
        bundle.write_string(email);
        bundle.send(&mut self.transport)
    }

    pub fn new_password(
        &mut self,
        catalog: &MessageCatalog,
        player_id: i32,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), SendError> {
        let msg = catalog
            .get("Baseapp_reqAccountNewPassword")
            .ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.write_i32(player_id);
        bundle.write_string(old_password);
        bundle.write_string(new_password);
        bundle.send(&mut self.transport)
    }

    /// Calls a method on the cell part of an entity. Arguments are checked
    /// against the schema before anything is queued.
    pub fn call_cell_method(
        &mut self,
        catalog: &MessageCatalog,
        schema: &SchemaRegistry,
        world: &World,
        entity_id: i32,
        method: &str,
        args: &[Value],
    ) -> Result<(), RemoteCallError> {
        let entity = world
            .entity(entity_id)
            .ok_or(RemoteCallError::UnknownEntity { id: entity_id })?;
        if !entity.has_cell {
            return Err(RemoteCallError::NoCell { id: entity_id });
        }
        let class = schema
            .class(&entity.class_name)
            .ok_or_else(|| RemoteCallError::UnknownClass {
                class: entity.class_name.clone(),
            })?;
        let def = class
            .cell_method(method)
            .ok_or_else(|| RemoteCallError::UnknownMethod {
                class: entity.class_name.clone(),
                method: method.to_string(),
            })?;
        let msg = catalog
            .get("Baseapp_onRemoteCallCellMethodFromClient")
            .ok_or_else(|| RemoteCallError::MissingMessage {
                name: "Baseapp_onRemoteCallCellMethodFromClient".to_string(),
            })?;
        self.send_call(schema, msg, entity_id, def, args)
    }

    /// Calls a method on the base part of an entity.
    pub fn call_base_method(
        &mut self,
        catalog: &MessageCatalog,
        schema: &SchemaRegistry,
        world: &World,
        entity_id: i32,
        method: &str,
        args: &[Value],
    ) -> Result<(), RemoteCallError> {
        let entity = world
            .entity(entity_id)
            .ok_or(RemoteCallError::UnknownEntity { id: entity_id })?;
        if !entity.has_base {
            return Err(RemoteCallError::NoBase { id: entity_id });
        }
        let class = schema
            .class(&entity.class_name)
            .ok_or_else(|| RemoteCallError::UnknownClass {
                class: entity.class_name.clone(),
            })?;
        let def = class
            .base_method(method)
            .ok_or_else(|| RemoteCallError::UnknownMethod {
                class: entity.class_name.clone(),
                method: method.to_string(),
            })?;
        let msg = catalog
            .get("Entity_onRemoteMethodCall")
            .ok_or_else(|| RemoteCallError::MissingMessage {
                name: "Entity_onRemoteMethodCall".to_string(),
            })?;
        self.send_call(schema, msg, entity_id, def, args)
    }

    fn send_call(
        &mut self,
        schema: &SchemaRegistry,
        msg: &MessageDescriptor,
        entity_id: i32,
        def: &MethodDef,
        args: &[Value],
    ) -> Result<(), RemoteCallError> {
        if args.len() != def.arg_types.len() {
            return Err(RemoteCallError::ArityMismatch {
                method: def.name.clone(),
                expected: def.arg_types.len(),
                got: args.len(),
            });
        }

        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.write_i32(entity_id);
        bundle.write_u16(def.utype);
        for (index, (&type_id, value)) in def.arg_types.iter().zip(args).enumerate() {
            if !schema.is_same_type(type_id, value) {
                return Err(RemoteCallError::ArgType {
                    method: def.name.clone(),
                    index,
                });
            }
            schema.encode_value(type_id, &mut bundle, value)?;
        }
        bundle.send(&mut self.transport)?;
        Ok(())
    }

    fn tick(
        &mut self,
        catalog: &MessageCatalog,
        world: &mut World,
        events: &mut Events,
        signals: &mut Vec<GatewaySignal>,
    ) {
        if !catalog.baseapp_imported() {
            return;
        }
        match self.heartbeat.poll() {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendTick => {
                if let Some(msg) = catalog.get("Baseapp_onClientActiveTick") {
                    let mut bundle = Bundle::new();
                    bundle.start_message(msg);
                    if bundle.send(&mut self.transport).is_err() {
                        debug!("tick to the gateway dropped, link is closing");
                    }
                }
            }
            HeartbeatAction::TimedOut => {
                error!("gateway stopped answering ticks, closing the link");
                self.transport.close();
                self.frames.clear();
                world.clear_entities(true, events);
                signals.push(GatewaySignal::Lost);
            }
        }
    }

    // ---- handlers ---------------------------------------------------

    fn on_hello_cb(
        &mut self,
        stream: &mut ByteStream,
        catalog: &mut MessageCatalog,
        schema: &mut SchemaRegistry,
        mut cache: Option<&mut BlobCache>,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let server_version = stream.read_string()?;
        let server_script_version = stream.read_string()?;
        let proto_md5 = stream.read_string()?;
        let entitydef_md5 = stream.read_string()?;
        let ctype = stream.read_i32()?;

        debug!(
            "GatewaySession::on_hello_cb: verInfo({}) scriptVersion({}) ctype({})",
            server_version, server_script_version, ctype
        );

        let digest_match = match cache.as_deref_mut() {
            Some(cache) => cache.on_server_digest(ServerApp::BaseApp, &proto_md5, &entitydef_md5),
            None => false,
        };

        // The message table and the entity schema restore independently;
        // each falls back to its own wire request.
        let mut messages_ok = false;
        if digest_match {
            if let Some(cache) = cache.as_deref_mut() {
                messages_ok = restore_messages(cache, catalog);
            }
        }
        if !messages_ok && self.request_import_messages(catalog).is_err() {
            error!("requesting the gateway message table failed");
        }

        let mut schema_ok = false;
        if digest_match {
            if let Some(cache) = cache.as_deref_mut() {
                schema_ok = restore_entity_def(cache, schema);
            }
        }
        if !schema_ok && self.request_import_entity_def(catalog).is_err() {
            error!("requesting the entity schema failed");
        }

        if messages_ok && schema_ok {
            debug!("gateway protocol restored from the local cache");
            signals.push(GatewaySignal::Ready);
        }
        Ok(())
    }

    fn on_version_not_match(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
        cache: Option<&mut BlobCache>,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let server_version = stream.read_string()?;
        error!(
            "gateway version not match: client({}) server({})",
            config.client_version, server_version
        );
        if let Some(cache) = cache {
            cache.clear_all_message_files();
        }
        signals.push(GatewaySignal::VersionMismatch { server_version });
        self.transport.close();
        Ok(())
    }

    fn on_script_version_not_match(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
        cache: Option<&mut BlobCache>,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let server_version = stream.read_string()?;
        error!(
            "gateway script version not match: client({}) server({})",
            config.client_script_version, server_version
        );
        if let Some(cache) = cache {
            cache.clear_all_message_files();
        }
        signals.push(GatewaySignal::ScriptVersionMismatch { server_version });
        self.transport.close();
        Ok(())
    }

    fn request_import_messages(&mut self, catalog: &MessageCatalog) -> Result<(), SendError> {
        let msg = catalog
            .get("Baseapp_importClientMessages")
            .ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.send(&mut self.transport)
    }

    fn request_import_entity_def(&mut self, catalog: &MessageCatalog) -> Result<(), SendError> {
        let msg = catalog
            .get("Baseapp_importClientEntityDef")
            .ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.send(&mut self.transport)
    }

    fn on_import_client_messages(
        &mut self,
        stream: &mut ByteStream,
        catalog: &mut MessageCatalog,
        schema: &SchemaRegistry,
        cache: Option<&mut BlobCache>,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let payload = stream.remaining().to_vec();
        catalog.import_from_stream(stream, ServerApp::BaseApp)?;
        if let Some(cache) = cache {
            cache.write_baseapp_messages(&payload);
        }
        if schema.imported() {
            signals.push(GatewaySignal::Ready);
        }
        Ok(())
    }

    fn on_import_client_entity_def(
        &mut self,
        stream: &mut ByteStream,
        catalog: &MessageCatalog,
        schema: &mut SchemaRegistry,
        cache: Option<&mut BlobCache>,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let payload = stream.remaining().to_vec();
        schema.import_from_stream(stream)?;
        if let Some(cache) = cache {
            cache.write_entity_def(&payload);
        }
        if catalog.baseapp_imported() {
            signals.push(GatewaySignal::Ready);
        }
        Ok(())
    }

    fn on_login_baseapp_failed(
        &mut self,
        stream: &mut ByteStream,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let code = stream.read_u16()?;
        error!(
            "GatewaySession::on_login_baseapp_failed: failedcode({})",
            code
        );
        signals.push(GatewaySignal::LoginFailed { code });
        Ok(())
    }

    fn on_relogin_baseapp_failed(
        &mut self,
        stream: &mut ByteStream,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let code = stream.read_u16()?;
        error!(
            "GatewaySession::on_relogin_baseapp_failed: failedcode({})",
            code
        );
        signals.push(GatewaySignal::ReloginFailed { code });
        Ok(())
    }

    /// The server re-bound the live proxy and rolled its session token.
    fn on_relogin_baseapp_successfully(
        &mut self,
        stream: &mut ByteStream,
        world: &mut World,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let uuid = stream.read_u64()?;
        world.set_player_uuid(uuid);
        debug!("GatewaySession::on_relogin_baseapp_successfully: uuid({})", uuid);
        signals.push(GatewaySignal::ReloginOk);
        Ok(())
    }

    fn on_bind_email_cb(
        &mut self,
        stream: &mut ByteStream,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let code = stream.read_u16()?;
        if code != 0 {
            error!("GatewaySession::on_bind_email_cb: failed, code({})", code);
        } else {
            debug!("GatewaySession::on_bind_email_cb: bound");
        }
        signals.push(GatewaySignal::EmailBound { code });
        Ok(())
    }

    fn on_new_password_cb(
        &mut self,
        stream: &mut ByteStream,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let code = stream.read_u16()?;
        if code != 0 {
            error!("GatewaySession::on_new_password_cb: failed, code({})", code);
        } else {
            debug!("GatewaySession::on_new_password_cb: changed");
        }
        signals.push(GatewaySignal::PasswordChanged { code });
        Ok(())
    }

    fn on_kicked(
        &mut self,
        stream: &mut ByteStream,
        signals: &mut Vec<GatewaySignal>,
    ) -> Result<(), GatewayError> {
        let code = stream.read_u16()?;
        warn!("GatewaySession::on_kicked: failedcode({})", code);
        signals.push(GatewaySignal::Kicked { code });
        Ok(())
    }
}

fn restore_messages(cache: &BlobCache, catalog: &mut MessageCatalog) -> bool {
    let mut blob = match cache.load_baseapp_messages() {
        Some(blob) => blob,
        None => return false,
    };
    if catalog
        .import_from_stream(&mut blob, ServerApp::BaseApp)
        .is_err()
    {
        // The import flips the flag entry by entry; a truncated blob must
        // not leave it set.
        catalog.set_baseapp_imported(false);
        return false;
    }
    true
}

fn restore_entity_def(cache: &BlobCache, schema: &mut SchemaRegistry) -> bool {
    let mut blob = match cache.load_entity_def() {
        Some(blob) => blob,
        None => return false,
    };
    if schema.import_from_stream(&mut blob).is_err() {
        schema.clear();
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::PathBuf;

    use kbe_shared::{DATATYPE_INT32, DATATYPE_UINT32, ED_FLAG_ALL_CLIENTS};

    const PLAYER_ID: i32 = 100;

    fn temp_root(tag: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("kbe-gateway-{}-{tag}", std::process::id()));
        let _ = fs::remove_dir_all(&path);
        path
    }

    fn message_blob(entries: &[(u16, i16, &str)]) -> Vec<u8> {
        let mut s = ByteStream::new();
        s.write_u16(entries.len() as u16);
        for (id, len, name) in entries {
            s.write_u16(*id);
            s.write_i16(*len);
            s.write_string(name);
            s.write_i8(-1);
            s.write_u8(0);
        }
        s.written().to_vec()
    }

    fn baseapp_messages() -> Vec<u8> {
        message_blob(&[
            (301, -1, "Baseapp_onRemoteCallCellMethodFromClient"),
            (302, -1, "Entity_onRemoteMethodCall"),
            (303, 0, "Baseapp_onClientActiveTick"),
        ])
    }

    fn schema_blob() -> Vec<u8> {
        let mut s = ByteStream::new();
        s.write_u16(0); // no aliases

        s.write_string("Avatar");
        s.write_u16(1);
        s.write_u16(1); // properties
        s.write_u16(0); // client methods
        s.write_u16(1); // base methods
        s.write_u16(1); // cell methods

        s.write_u16(5);
        s.write_u32(ED_FLAG_ALL_CLIENTS);
        s.write_i16(0);
        s.write_string("hp");
        s.write_string("100");
        s.write_u16(DATATYPE_INT32);

        // reqTeleport(i32)
        s.write_u16(20);
        s.write_i16(-1);
        s.write_string("reqTeleport");
        s.write_u8(1);
        s.write_u16(DATATYPE_INT32);

        // useSkill(u32, i32)
        s.write_u16(30);
        s.write_i16(-1);
        s.write_string("useSkill");
        s.write_u8(2);
        s.write_u16(DATATYPE_UINT32);
        s.write_u16(DATATYPE_INT32);

        s.written().to_vec()
    }

    fn imported_schema() -> SchemaRegistry {
        let mut schema = SchemaRegistry::new();
        let mut blob = ByteStream::from_bytes(&schema_blob());
        schema.import_from_stream(&mut blob).unwrap();
        schema
    }

    fn imported_catalog() -> MessageCatalog {
        let mut catalog = MessageCatalog::new();
        let mut blob = ByteStream::from_bytes(&baseapp_messages());
        catalog
            .import_from_stream(&mut blob, ServerApp::BaseApp)
            .unwrap();
        catalog
    }

    fn world_with_player(schema: &SchemaRegistry) -> World {
        let mut world = World::new();
        let mut events = Events::new();
        let config = ClientConfig::default();
        let mut s = ByteStream::new();
        s.write_u64(0x77);
        s.write_i32(PLAYER_ID);
        s.write_string("Avatar");
        let mut stream = ByteStream::from_bytes(s.written());
        world
            .on_created_proxies(&mut stream, schema, &config, &mut events)
            .unwrap();
        world
    }

    fn hello_cb_body(proto_md5: &str, entitydef_md5: &str) -> ByteStream {
        let mut s = ByteStream::new();
        s.write_string("2.5.12");
        s.write_string("0.1.0");
        s.write_string(proto_md5);
        s.write_string(entitydef_md5);
        s.write_i32(7);
        ByteStream::from_bytes(s.written())
    }

    // ========== Hello / Import ==========

    #[test]
    fn hello_cb_restores_both_tables_from_a_warm_cache() {
        let root = temp_root("warm");
        let config = ClientConfig::default();

        let mut seed = BlobCache::new(root.clone(), &config);
        seed.on_server_digest(ServerApp::BaseApp, "proto", "def");
        seed.write_baseapp_messages(&baseapp_messages());
        seed.write_entity_def(&schema_blob());

        let mut cache = BlobCache::new(root, &config);
        let mut catalog = MessageCatalog::new();
        let mut schema = SchemaRegistry::new();
        let mut session = GatewaySession::new(&config);
        let mut signals = Vec::new();

        session
            .on_hello_cb(
                &mut hello_cb_body("proto", "def"),
                &mut catalog,
                &mut schema,
                Some(&mut cache),
                &mut signals,
            )
            .unwrap();

        assert_eq!(signals, vec![GatewaySignal::Ready]);
        assert!(catalog.baseapp_imported());
        assert!(catalog.get("Baseapp_onClientActiveTick").is_some());
        assert!(schema.imported());
        assert!(schema.class("Avatar").is_some());
    }

    #[test]
    fn hello_cb_with_half_a_cache_stays_unready_until_the_wire_fills_in() {
        let root = temp_root("half");
        let config = ClientConfig::default();

        // Only the message table was cached; the schema must come over
        // the wire.
        let mut seed = BlobCache::new(root.clone(), &config);
        seed.on_server_digest(ServerApp::BaseApp, "proto", "def");
        seed.write_baseapp_messages(&baseapp_messages());

        let mut cache = BlobCache::new(root, &config);
        let mut catalog = MessageCatalog::new();
        let mut schema = SchemaRegistry::new();
        let mut session = GatewaySession::new(&config);
        let mut signals = Vec::new();

        session
            .on_hello_cb(
                &mut hello_cb_body("proto", "def"),
                &mut catalog,
                &mut schema,
                Some(&mut cache),
                &mut signals,
            )
            .unwrap();

        assert!(signals.is_empty());
        assert!(catalog.baseapp_imported());
        assert!(!schema.imported());

        let mut body = ByteStream::from_bytes(&schema_blob());
        session
            .on_import_client_entity_def(&mut body, &catalog, &mut schema, None, &mut signals)
            .unwrap();
        assert_eq!(signals, vec![GatewaySignal::Ready]);
        assert!(schema.imported());
    }

    #[test]
    fn wire_import_chain_reaches_ready_when_both_tables_land() {
        let config = ClientConfig::default();
        let mut catalog = MessageCatalog::new();
        let mut schema = SchemaRegistry::new();
        let mut session = GatewaySession::new(&config);
        let mut signals = Vec::new();

        let mut body = ByteStream::from_bytes(&baseapp_messages());
        session
            .on_import_client_messages(&mut body, &mut catalog, &schema, None, &mut signals)
            .unwrap();
        assert!(signals.is_empty());

        let mut body = ByteStream::from_bytes(&schema_blob());
        session
            .on_import_client_entity_def(&mut body, &catalog, &mut schema, None, &mut signals)
            .unwrap();
        assert_eq!(signals, vec![GatewaySignal::Ready]);
    }

    // ========== Relogin / Account ==========

    #[test]
    fn relogin_success_rolls_the_player_uuid() {
        let config = ClientConfig::default();
        let schema = imported_schema();
        let mut world = world_with_player(&schema);
        let mut session = GatewaySession::new(&config);
        let mut signals = Vec::new();

        let mut s = ByteStream::new();
        s.write_u64(0x99);
        let mut body = ByteStream::from_bytes(s.written());
        session
            .on_relogin_baseapp_successfully(&mut body, &mut world, &mut signals)
            .unwrap();

        assert_eq!(signals, vec![GatewaySignal::ReloginOk]);
        assert_eq!(world.player_uuid(), 0x99);
    }

    #[test]
    fn account_callbacks_surface_their_codes() {
        let config = ClientConfig::default();
        let mut session = GatewaySession::new(&config);
        let mut signals = Vec::new();

        let mut s = ByteStream::new();
        s.write_u16(0);
        let mut body = ByteStream::from_bytes(s.written());
        session.on_bind_email_cb(&mut body, &mut signals).unwrap();

        let mut s = ByteStream::new();
        s.write_u16(7);
        let mut body = ByteStream::from_bytes(s.written());
        session.on_new_password_cb(&mut body, &mut signals).unwrap();

        let mut s = ByteStream::new();
        s.write_u16(5);
        let mut body = ByteStream::from_bytes(s.written());
        session.on_kicked(&mut body, &mut signals).unwrap();

        assert_eq!(
            signals,
            vec![
                GatewaySignal::EmailBound { code: 0 },
                GatewaySignal::PasswordChanged { code: 7 },
                GatewaySignal::Kicked { code: 5 },
            ]
        );
    }

    // ========== Remote Calls ==========

    #[test]
    fn cell_call_requires_the_entity_and_its_cell() {
        let config = ClientConfig::default();
        let catalog = imported_catalog();
        let schema = imported_schema();
        let world = world_with_player(&schema);
        let mut session = GatewaySession::new(&config);

        let err = session
            .call_cell_method(&catalog, &schema, &world, 999, "useSkill", &[])
            .unwrap_err();
        assert!(matches!(err, RemoteCallError::UnknownEntity { id: 999 }));

        // The proxy has a base part but no cell until it enters the world.
        let err = session
            .call_cell_method(&catalog, &schema, &world, PLAYER_ID, "useSkill", &[])
            .unwrap_err();
        assert!(matches!(err, RemoteCallError::NoCell { id: PLAYER_ID }));
    }

    #[test]
    fn base_call_validates_method_name_arity_and_types() {
        let config = ClientConfig::default();
        let catalog = imported_catalog();
        let schema = imported_schema();
        let world = world_with_player(&schema);
        let mut session = GatewaySession::new(&config);

        let err = session
            .call_base_method(&catalog, &schema, &world, PLAYER_ID, "noSuchMethod", &[])
            .unwrap_err();
        assert!(matches!(err, RemoteCallError::UnknownMethod { .. }));

        let err = session
            .call_base_method(&catalog, &schema, &world, PLAYER_ID, "reqTeleport", &[])
            .unwrap_err();
        assert!(matches!(
            err,
            RemoteCallError::ArityMismatch {
                expected: 1,
                got: 0,
                ..
            }
        ));

        let err = session
            .call_base_method(
                &catalog,
                &schema,
                &world,
                PLAYER_ID,
                "reqTeleport",
                &[Value::String("here".to_string())],
            )
            .unwrap_err();
        assert!(matches!(err, RemoteCallError::ArgType { index: 0, .. }));

        // Everything checks out, so the failure moves to the dead link.
        let err = session
            .call_base_method(
                &catalog,
                &schema,
                &world,
                PLAYER_ID,
                "reqTeleport",
                &[Value::Int32(5)],
            )
            .unwrap_err();
        assert!(matches!(err, RemoteCallError::Send(_)));
    }
}
