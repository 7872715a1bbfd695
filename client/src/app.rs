//! Top-level client runtime.
//!
//! [`ClientRuntime`] owns the whole connection lifecycle: it drives the
//! login-server session for authentication and account operations, hands
//! off to the gateway session the login server names, and keeps the
//! shared protocol state (message catalog, entity schema, error table,
//! blob cache) that both sessions import into. The embedding game loop
//! calls [`ClientRuntime::process`] once per frame and drains the event
//! queue afterwards; nothing here ever calls back into user code.

use log::{debug, error, warn};

use kbe_shared::{
    MessageCatalog, SchemaRegistry, ServerErrorTable, Value, ERR_CONNECT_TO_BASEAPP_FAULT,
    ERR_CONNECT_TO_LOGINAPP_FAULT, ERR_INVALID_NETWORK, ERR_SUCCESS,
};

use crate::cache::BlobCache;
use crate::config::ClientConfig;
use crate::entity::Entity;
use crate::events::{ClientEvent, Events};
use crate::gateway::{GatewaySession, GatewaySignal, RemoteCallError};
use crate::login::{LoginSession, LoginSignal};
use crate::math::Vec3;
use crate::world::World;

/// Which account operation the login handshake was started for. The
/// request itself is only sent once the protocol import finishes.
enum Intent {
    Login,
    CreateAccount,
    ResetPassword,
}

/// The client network runtime.
///
/// One instance per server connection. All I/O happens on background
/// transport threads; this type is single-threaded and only touches the
/// sockets' queues from [`process`](Self::process).
pub struct ClientRuntime {
    config: ClientConfig,
    catalog: MessageCatalog,
    schema: SchemaRegistry,
    errors: ServerErrorTable,
    cache: Option<BlobCache>,
    events: Events,
    world: World,

    login: Option<LoginSession>,
    gateway: Option<GatewaySession>,

    intent: Intent,
    account: String,
    password: String,
    client_datas: Vec<u8>,
    /// Account name the gateway expects; the login server may rewrite it.
    gateway_account: String,
    /// A session reported its link dead this frame. The drop happens at
    /// the top of the next `process()`, never inside the signal handler
    /// that noticed it.
    lose_pending: bool,
}

impl ClientRuntime {
    pub fn new(config: ClientConfig) -> ClientRuntime {
        let cache = config
            .persistent_data_path
            .clone()
            .map(|root| BlobCache::new(root, &config));
        ClientRuntime {
            catalog: MessageCatalog::new(),
            schema: SchemaRegistry::new(),
            errors: ServerErrorTable::new(),
            cache,
            events: Events::new(),
            world: World::new(),
            login: None,
            gateway: None,
            intent: Intent::Login,
            account: String::new(),
            password: String::new(),
            client_datas: Vec::new(),
            gateway_account: String::new(),
            lose_pending: false,
            config,
        }
    }

    // ---- per-frame pump ---------------------------------------------

    /// Drains both sessions' sockets, dispatches every complete frame and
    /// fires the heartbeat. Call once per game-loop tick, then
    /// [`drain_events`](Self::drain_events).
    pub fn process(&mut self) {
        if self.lose_pending {
            self.login = None;
            self.gateway = None;
            self.lose_pending = false;
        }
        self.process_login();
        self.process_gateway();
    }

    fn process_login(&mut self) {
        let mut session = match self.login.take() {
            Some(session) => session,
            None => return,
        };
        let mut signals = Vec::new();
        session.process(
            &mut self.catalog,
            &mut self.errors,
            self.cache.as_mut(),
            &self.config,
            &mut signals,
        );
        // Handlers may take the session again, to close it.
        self.login = Some(session);
        for signal in signals {
            self.on_login_signal(signal);
        }
    }

    fn process_gateway(&mut self) {
        let mut session = match self.gateway.take() {
            Some(session) => session,
            None => return,
        };
        let mut signals = Vec::new();
        session.process(
            &mut self.catalog,
            &mut self.schema,
            &mut self.world,
            self.cache.as_mut(),
            &self.config,
            &mut self.events,
            &mut signals,
        );
        self.gateway = Some(session);
        for signal in signals {
            self.on_gateway_signal(signal);
        }
    }

    fn on_login_signal(&mut self, signal: LoginSignal) {
        match signal {
            LoginSignal::ConnectFailed => {
                self.events.push(ClientEvent::LoginAppConnected {
                    code: ERR_CONNECT_TO_LOGINAPP_FAULT,
                });
            }
            LoginSignal::Ready => {
                self.events
                    .push(ClientEvent::LoginAppConnected { code: ERR_SUCCESS });
                self.send_login_intent();
            }
            LoginSignal::VersionMismatch { server_version } => {
                self.events.push(ClientEvent::VersionNotMatch {
                    client_version: self.config.client_version.clone(),
                    server_version,
                });
            }
            LoginSignal::ScriptVersionMismatch { server_version } => {
                self.events.push(ClientEvent::ScriptVersionNotMatch {
                    client_version: self.config.client_script_version.clone(),
                    server_version,
                });
            }
            LoginSignal::LoginOk {
                account,
                host,
                tcp_port,
                udp_port,
            } => {
                debug!(
                    "ClientRuntime::on_login_signal: login ok, gateway at {}:{}|{}",
                    host, tcp_port, udp_port
                );
                self.gateway_account = account;
                self.events.push(ClientEvent::LoginSuccess {
                    account: self.account.clone(),
                });
                // The login handshake is done; drop the link now so a
                // late EOF from the loginapp cannot flag a disconnect
                // while the gateway handshake is in flight.
                self.close_login();
                let mut session = GatewaySession::new(&self.config);
                session.connect(&self.config, &host, tcp_port, udp_port);
                self.gateway = Some(session);
            }
            LoginSignal::LoginFailed { code, datas } => {
                let code = i32::from(code);
                debug!(
                    "ClientRuntime::on_login_signal: login failed, code={} datas={}B",
                    code,
                    datas.len()
                );
                let (name, descr) = self.resolved(code);
                self.events
                    .push(ClientEvent::LoginFailed { code, name, descr });
            }
            LoginSignal::AccountCreated { code, datas } => {
                let code = i32::from(code);
                debug!(
                    "ClientRuntime::on_login_signal: account created cb, code={} datas={}B",
                    code,
                    datas.len()
                );
                let (name, descr) = self.resolved(code);
                self.events
                    .push(ClientEvent::AccountCreated { code, name, descr });
            }
            LoginSignal::PasswordReset { code } => {
                let code = i32::from(code);
                let (name, descr) = self.resolved(code);
                self.events
                    .push(ClientEvent::PasswordReset { code, name, descr });
            }
            LoginSignal::Lost => {
                self.events.push(ClientEvent::Disconnected);
                self.lose_pending = true;
            }
        }
    }

    fn on_gateway_signal(&mut self, signal: GatewaySignal) {
        match signal {
            GatewaySignal::ConnectFailed => {
                self.close_login();
                self.events.push(ClientEvent::BaseAppConnected {
                    code: ERR_CONNECT_TO_BASEAPP_FAULT,
                });
            }
            GatewaySignal::Ready => {
                self.close_login();
                self.events
                    .push(ClientEvent::BaseAppConnected { code: ERR_SUCCESS });
                if let Some(session) = self.gateway.as_mut() {
                    if session
                        .login(&self.catalog, &self.gateway_account, &self.password)
                        .is_err()
                    {
                        error!("ClientRuntime::on_gateway_signal: gateway login not queued");
                    }
                }
            }
            GatewaySignal::VersionMismatch { server_version } => {
                self.close_login();
                self.events.push(ClientEvent::VersionNotMatch {
                    client_version: self.config.client_version.clone(),
                    server_version,
                });
            }
            GatewaySignal::ScriptVersionMismatch { server_version } => {
                self.close_login();
                self.events.push(ClientEvent::ScriptVersionNotMatch {
                    client_version: self.config.client_script_version.clone(),
                    server_version,
                });
            }
            GatewaySignal::LoginFailed { code } => {
                let code = i32::from(code);
                let (name, descr) = self.resolved(code);
                self.events
                    .push(ClientEvent::LoginFailed { code, name, descr });
            }
            GatewaySignal::ReloginOk => {
                let (name, descr) = self.resolved(ERR_SUCCESS);
                self.events.push(ClientEvent::ReloginResult {
                    code: ERR_SUCCESS,
                    name,
                    descr,
                });
            }
            GatewaySignal::ReloginFailed { code } => {
                let code = i32::from(code);
                let (name, descr) = self.resolved(code);
                self.events
                    .push(ClientEvent::ReloginResult { code, name, descr });
            }
            GatewaySignal::EmailBound { code } => {
                let code = i32::from(code);
                let (name, descr) = self.resolved(code);
                self.events
                    .push(ClientEvent::AccountEmailBound { code, name, descr });
            }
            GatewaySignal::PasswordChanged { code } => {
                let code = i32::from(code);
                let (name, descr) = self.resolved(code);
                self.events
                    .push(ClientEvent::PasswordChanged { code, name, descr });
            }
            GatewaySignal::Kicked { code } => {
                let code = i32::from(code);
                let (name, descr) = self.resolved(code);
                self.events.push(ClientEvent::Kicked { code, name, descr });
            }
            GatewaySignal::Lost => {
                self.events.push(ClientEvent::Disconnected);
                self.lose_pending = true;
            }
        }
    }

    /// Closed on the login verdict, and again if the gateway handshake
    /// fails with the link somehow still up. A failed gateway connect
    /// leaves nothing to fall back to; the login handshake is already
    /// spent.
    fn close_login(&mut self) {
        if let Some(mut session) = self.login.take() {
            session.close();
        }
    }

    fn send_login_intent(&mut self) {
        let session = match self.login.as_mut() {
            Some(session) => session,
            None => return,
        };
        let sent = match self.intent {
            Intent::Login => session.login(
                &self.catalog,
                &self.config,
                &self.account,
                &self.password,
                &self.client_datas,
            ),
            Intent::CreateAccount => session.create_account(
                &self.catalog,
                &self.account,
                &self.password,
                &self.client_datas,
            ),
            Intent::ResetPassword => session.reset_password(&self.catalog, &self.account),
        };
        if sent.is_err() {
            error!("ClientRuntime::send_login_intent: request not queued");
        }
    }

    // ---- account operations -----------------------------------------

    /// Starts a full login: connect to the login server, authenticate,
    /// then connect to the gateway it names. `datas` is handed to the
    /// server-side account script untouched.
    pub fn login(&mut self, account: &str, password: &str, datas: &[u8]) {
        if !self.start_flow(Intent::Login, account, password, datas) {
            return;
        }
        self.connect_login_app();
    }

    pub fn create_account(&mut self, account: &str, password: &str, datas: &[u8]) {
        if !self.start_flow(Intent::CreateAccount, account, password, datas) {
            return;
        }
        self.connect_login_app();
    }

    pub fn reset_password(&mut self, account: &str) {
        if !self.start_flow(Intent::ResetPassword, account, "", &[]) {
            return;
        }
        self.connect_login_app();
    }

    /// Stores the credentials and wipes per-connection protocol state. A
    /// runtime with a live session refuses to start over; call
    /// [`disconnect`](Self::disconnect) first.
    fn start_flow(&mut self, intent: Intent, account: &str, password: &str, datas: &[u8]) -> bool {
        if self.login.is_some() || self.gateway.is_some() {
            warn!("ClientRuntime::start_flow: a session is already active");
            return false;
        }
        if account.is_empty() {
            warn!("ClientRuntime::start_flow: empty account name");
            return false;
        }
        // The schema is re-imported per connection; a stale one could
        // alias-decode against the wrong layout.
        self.schema.clear();
        self.catalog.set_baseapp_imported(false);
        self.world = World::new();
        self.intent = intent;
        self.account = account.to_string();
        self.password = password.to_string();
        self.client_datas = datas.to_vec();
        self.gateway_account.clear();
        true
    }

    fn connect_login_app(&mut self) {
        let mut session = LoginSession::new(&self.config);
        session.connect(&self.config.host, self.config.port);
        self.login = Some(session);
    }

    /// Re-binds to a proxy the server kept alive after a drop. Uses the
    /// identity of the last successful login; only meaningful while the
    /// server still holds the entity.
    pub fn relogin(&mut self) {
        if !self.gateway_valid() {
            let (name, descr) = self.resolved(ERR_INVALID_NETWORK);
            self.events.push(ClientEvent::ReloginResult {
                code: ERR_INVALID_NETWORK,
                name,
                descr,
            });
            return;
        }
        let uuid = self.world.player_uuid();
        let eid = self.world.player_id();
        if let Some(session) = self.gateway.as_mut() {
            if session
                .relogin(
                    &self.catalog,
                    &self.gateway_account,
                    &self.password,
                    uuid,
                    eid,
                )
                .is_err()
            {
                error!("ClientRuntime::relogin: request not queued");
            }
        }
    }

    /// Binds an email address to the logged-in account. The stored
    /// password authenticates the request.
    pub fn bind_account_email(&mut self, email: &str) {
        if !self.gateway_valid() {
            let (name, descr) = self.resolved(ERR_INVALID_NETWORK);
            self.events.push(ClientEvent::AccountEmailBound {
                code: ERR_INVALID_NETWORK,
                name,
                descr,
            });
            return;
        }
        let player_id = self.world.player_id();
        if let Some(session) = self.gateway.as_mut() {
            if session
                .bind_account_email(&self.catalog, player_id, &self.password, email)
                .is_err()
            {
                error!("ClientRuntime::bind_account_email: request not queued");
            }
        }
    }

    pub fn new_password(&mut self, old_password: &str, new_password: &str) {
        if !self.gateway_valid() {
            let (name, descr) = self.resolved(ERR_INVALID_NETWORK);
            self.events.push(ClientEvent::PasswordChanged {
                code: ERR_INVALID_NETWORK,
                name,
                descr,
            });
            return;
        }
        let player_id = self.world.player_id();
        if let Some(session) = self.gateway.as_mut() {
            if session
                .new_password(&self.catalog, player_id, old_password, new_password)
                .is_err()
            {
                error!("ClientRuntime::new_password: request not queued");
            }
        }
    }

    /// Drops every connection and forgets the stored credentials. Does
    /// not push [`ClientEvent::Disconnected`]; the embedder asked.
    pub fn disconnect(&mut self) {
        self.account.clear();
        self.password.clear();
        self.client_datas.clear();
        self.gateway_account.clear();

        if let Some(mut session) = self.login.take() {
            session.close();
        }
        if let Some(mut session) = self.gateway.take() {
            session.close();
        }

        self.world.clear_entities(true, &mut self.events);
        self.world = World::new();
        self.schema.clear();
        self.catalog.reset();
        self.catalog.set_loginapp_imported(false);
        self.catalog.set_baseapp_imported(false);
        self.lose_pending = false;
    }

    // ---- entity method calls ----------------------------------------

    /// Calls a method on the cell part of an entity the client may speak
    /// for. Arguments are schema-checked before anything is queued.
    pub fn call_cell_method(
        &mut self,
        entity_id: i32,
        method: &str,
        args: &[Value],
    ) -> Result<(), RemoteCallError> {
        let session = match self.gateway.as_mut() {
            Some(session) => session,
            None => return Err(RemoteCallError::NoNetwork),
        };
        session.call_cell_method(
            &self.catalog,
            &self.schema,
            &self.world,
            entity_id,
            method,
            args,
        )
    }

    /// Calls a method on the base part of an entity.
    pub fn call_base_method(
        &mut self,
        entity_id: i32,
        method: &str,
        args: &[Value],
    ) -> Result<(), RemoteCallError> {
        let session = match self.gateway.as_mut() {
            Some(session) => session,
            None => return Err(RemoteCallError::NoNetwork),
        };
        session.call_base_method(
            &self.catalog,
            &self.schema,
            &self.world,
            entity_id,
            method,
            args,
        )
    }

    // ---- movement ---------------------------------------------------

    /// Moves an entity this client controls. The change syncs upstream on
    /// the next volatile tick.
    pub fn update_entity_transform(&mut self, entity_id: i32, position: Vec3, direction: Vec3) {
        self.world.update_entity_transform(entity_id, position, direction);
    }

    pub fn update_player_transform(&mut self, position: Vec3, direction: Vec3) {
        let eid = self.world.player_id();
        self.world.update_entity_transform(eid, position, direction);
    }

    // ---- lookups ----------------------------------------------------

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn player(&self) -> Option<&Entity> {
        self.world.player()
    }

    pub fn entity(&self, entity_id: i32) -> Option<&Entity> {
        self.world.entity(entity_id)
    }

    /// True while the gateway link is up. The login-server link does not
    /// count; it exists only to reach the gateway.
    pub fn is_connected(&self) -> bool {
        self.gateway_valid()
    }

    fn gateway_valid(&self) -> bool {
        self.gateway.as_ref().map_or(false, GatewaySession::valid)
    }

    /// Everything that happened since the last drain, in arrival order.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain()
    }

    pub fn server_error_name(&self, code: i32) -> String {
        self.errors.error_name(code)
    }

    pub fn server_error_descr(&self, code: i32) -> String {
        self.errors.error_descr(code)
    }

    fn resolved(&self, code: i32) -> (String, String) {
        (self.errors.error_name(code), self.errors.error_descr(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> ClientRuntime {
        ClientRuntime::new(ClientConfig::default())
    }

    // ========== Operations without a network ==========

    #[test]
    fn relogin_without_a_gateway_reports_invalid_network() {
        let mut runtime = runtime();
        runtime.relogin();

        let events = runtime.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ClientEvent::ReloginResult { code, name, .. } => {
                assert_eq!(*code, ERR_INVALID_NETWORK);
                assert_eq!(name, "INVALID_NETWORK");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn account_operations_without_a_gateway_report_invalid_network() {
        let mut runtime = runtime();
        runtime.bind_account_email("a@b.c");
        runtime.new_password("old", "new");

        let events = runtime.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            ClientEvent::AccountEmailBound {
                code: ERR_INVALID_NETWORK,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            ClientEvent::PasswordChanged {
                code: ERR_INVALID_NETWORK,
                ..
            }
        ));
    }

    #[test]
    fn method_calls_without_a_gateway_are_refused() {
        let mut runtime = runtime();
        assert!(matches!(
            runtime.call_cell_method(1, "useSkill", &[]),
            Err(RemoteCallError::NoNetwork)
        ));
        assert!(matches!(
            runtime.call_base_method(1, "reqTeleport", &[]),
            Err(RemoteCallError::NoNetwork)
        ));
    }

    #[test]
    fn processing_an_idle_runtime_does_nothing() {
        let mut runtime = runtime();
        runtime.process();
        assert!(runtime.drain_events().is_empty());
        assert!(!runtime.is_connected());
    }

    #[test]
    fn empty_account_names_are_refused() {
        let mut runtime = runtime();
        runtime.login("", "secret", &[]);
        assert!(runtime.login.is_none());
    }

    // ========== Signal wiring ==========

    #[test]
    fn login_ok_spawns_the_gateway_and_closes_the_login_link() {
        let mut runtime = runtime();
        runtime.account = "alice".to_string();
        runtime.login = Some(LoginSession::new(&runtime.config));

        runtime.on_login_signal(LoginSignal::LoginOk {
            account: "svc_alice".to_string(),
            host: "127.0.0.1".to_string(),
            tcp_port: 1,
            udp_port: 0,
        });

        assert_eq!(runtime.gateway_account, "svc_alice");
        // A loginapp EOF after the verdict must not be able to tear down
        // the gateway handshake through a deferred session drop.
        assert!(runtime.login.is_none());
        assert!(!runtime.lose_pending);
        let gateway = runtime.gateway.as_ref().unwrap();
        assert!(!gateway.uses_udp());

        let events = runtime.drain_events();
        assert_eq!(
            events,
            vec![ClientEvent::LoginSuccess {
                account: "alice".to_string()
            }]
        );
    }

    #[test]
    fn gateway_resolution_closes_the_login_link() {
        let mut runtime = runtime();
        runtime.login = Some(LoginSession::new(&runtime.config));
        runtime.gateway = Some(GatewaySession::new(&runtime.config));

        runtime.on_gateway_signal(GatewaySignal::Ready);

        assert!(runtime.login.is_none());
        let events = runtime.drain_events();
        assert_eq!(
            events,
            vec![ClientEvent::BaseAppConnected { code: ERR_SUCCESS }]
        );
    }

    #[test]
    fn gateway_connect_failure_closes_the_login_link_too() {
        let mut runtime = runtime();
        runtime.login = Some(LoginSession::new(&runtime.config));
        runtime.gateway = Some(GatewaySession::new(&runtime.config));

        runtime.on_gateway_signal(GatewaySignal::ConnectFailed);

        assert!(runtime.login.is_none());
        let events = runtime.drain_events();
        assert_eq!(
            events,
            vec![ClientEvent::BaseAppConnected {
                code: ERR_CONNECT_TO_BASEAPP_FAULT
            }]
        );
    }

    #[test]
    fn a_lost_link_is_dropped_on_the_next_process() {
        let mut runtime = runtime();
        runtime.gateway = Some(GatewaySession::new(&runtime.config));

        runtime.on_gateway_signal(GatewaySignal::Lost);
        assert!(runtime.gateway.is_some());
        assert_eq!(runtime.drain_events(), vec![ClientEvent::Disconnected]);

        runtime.process();
        assert!(runtime.gateway.is_none());
        assert!(!runtime.lose_pending);
    }

    #[test]
    fn gateway_failure_codes_resolve_through_the_error_table() {
        let mut runtime = runtime();
        runtime.on_gateway_signal(GatewaySignal::Kicked { code: 9999 });

        let events = runtime.drain_events();
        match &events[0] {
            ClientEvent::Kicked { code, name, .. } => {
                assert_eq!(*code, 9999);
                assert_eq!(name, "Unknown error code(9999)");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn version_mismatch_reports_both_versions() {
        let mut runtime = runtime();
        runtime.on_login_signal(LoginSignal::VersionMismatch {
            server_version: "2.0.0".to_string(),
        });

        let events = runtime.drain_events();
        assert_eq!(
            events,
            vec![ClientEvent::VersionNotMatch {
                client_version: runtime.config.client_version.clone(),
                server_version: "2.0.0".to_string(),
            }]
        );
    }

    // ========== Disconnect ==========

    #[test]
    fn disconnect_forgets_credentials_and_handshake_state() {
        let mut runtime = runtime();
        runtime.account = "alice".to_string();
        runtime.password = "secret".to_string();
        runtime.gateway_account = "svc_alice".to_string();
        runtime.catalog.set_loginapp_imported(true);
        runtime.catalog.set_baseapp_imported(true);
        runtime.gateway = Some(GatewaySession::new(&runtime.config));

        runtime.disconnect();

        assert!(runtime.account.is_empty());
        assert!(runtime.password.is_empty());
        assert!(runtime.gateway_account.is_empty());
        assert!(runtime.gateway.is_none());
        assert!(!runtime.catalog.loginapp_imported());
        assert!(!runtime.catalog.baseapp_imported());
        assert!(!runtime.is_connected());
        // Deliberate disconnects are not "lost connections".
        assert!(runtime.drain_events().is_empty());
    }
}
