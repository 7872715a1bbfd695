//! Login server session.
//!
//! Owns the TCP link to the login server and walks the handshake: hello,
//! protocol import (from the local cache when the server digest matches,
//! over the wire otherwise), then whichever account operation the caller
//! queued. Every outcome surfaces as a [`LoginSignal`]; the session never
//! decides what an outcome means for the client as a whole.

use log::{debug, error, warn};

use kbe_shared::{
    Bundle, ByteStream, Frame, MessageCatalog, SendError, ServerApp, ServerErrorTable, StreamError,
};

use crate::cache::BlobCache;
use crate::config::ClientConfig;
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::transport::{TcpTransport, Transport, TransportSignal};

/// What one `process()` of the login session produced.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginSignal {
    /// The TCP connect failed; no handshake took place.
    ConnectFailed,
    /// Handshake and protocol import finished; operations may be sent.
    Ready,
    VersionMismatch { server_version: String },
    ScriptVersionMismatch { server_version: String },
    /// Credentials accepted. `account` is the name the gateway expects,
    /// which the server may have rewritten.
    LoginOk {
        account: String,
        host: String,
        tcp_port: u16,
        udp_port: u16,
    },
    LoginFailed { code: u16, datas: Vec<u8> },
    AccountCreated { code: u16, datas: Vec<u8> },
    PasswordReset { code: u16 },
    /// The link died: socket error, unreadable stream, or tick timeout.
    Lost,
}

pub struct LoginSession {
    transport: TcpTransport,
    heartbeat: Heartbeat,
    frames: Vec<Frame>,
}

impl LoginSession {
    pub fn new(config: &ClientConfig) -> LoginSession {
        LoginSession {
            transport: TcpTransport::new(config.tcp_recv_buffer_max, config.tcp_send_buffer_max),
            heartbeat: Heartbeat::new(config.server_heartbeat_tick),
            frames: Vec::new(),
        }
    }

    /// Starts a background connect. The outcome arrives through a later
    /// `process()` as `ConnectFailed`, or eventually `Ready`.
    pub fn connect(&mut self, host: &str, port: u16) {
        self.transport.connect(host, port);
    }

    pub fn valid(&self) -> bool {
        self.transport.valid()
    }

    /// Deliberate teardown. Never produces a `Lost` signal.
    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn process(
        &mut self,
        catalog: &mut MessageCatalog,
        errors: &mut ServerErrorTable,
        mut cache: Option<&mut BlobCache>,
        config: &ClientConfig,
        signals: &mut Vec<LoginSignal>,
    ) {
        match self.transport.process(catalog, &mut self.frames) {
            TransportSignal::ConnectDone { success: true } => {
                self.heartbeat.reset();
                if self.send_hello(catalog, config).is_err() {
                    error!("sending hello to the login server failed");
                }
            }
            TransportSignal::ConnectDone { success: false } => {
                signals.push(LoginSignal::ConnectFailed);
            }
            TransportSignal::ConnectionLost => {
                self.frames.clear();
                signals.push(LoginSignal::Lost);
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
                    warn!("login server sent unknown message id {}", frame.id);
                    continue;
                }
            };
            let mut body = frame.body;

            let handled = match name.as_str() {
                "Client_onHelloCB" => {
                    self.on_hello_cb(&mut body, catalog, errors, cache.as_deref_mut(), signals)
                }
                "Client_onVersionNotMatch" => {
                    self.on_version_not_match(&mut body, config, cache.as_deref_mut(), signals)
                }
                "Client_onScriptVersionNotMatch" => {
                    self.on_script_version_not_match(&mut body, config, cache.as_deref_mut(), signals)
                }
                "Client_onImportClientMessages" => {
                    self.on_import_client_messages(&mut body, catalog, cache.as_deref_mut(), signals)
                }
                "Client_onImportServerErrorsDescr" => {
                    self.on_import_server_errors(&mut body, errors, cache.as_deref_mut(), signals)
                }
                "Client_onLoginFailed" => self.on_login_failed(&mut body, signals),
                "Client_onLoginSuccessfully" => self.on_login_successfully(&mut body, signals),
                "Client_onCreateAccountResult" => self.on_create_account_result(&mut body, signals),
                "Client_onReqAccountResetPasswordCB" => {
                    self.on_reset_password_cb(&mut body, signals)
                }
                "Client_onAppActiveTickCB" => {
                    self.heartbeat.on_reply();
                    Ok(())
                }
                _ => {
                    error!("LoginSession::process: unhandled message {}", name);
                    Ok(())
                }
            };
            if let Err(err) = handled {
                error!("handling {} from the login server failed: {}", name, err);
                self.transport.will_close();
            }
        }
        self.frames = frames;

        self.tick(catalog, signals);
    }

    // ---- requests ---------------------------------------------------

    fn send_hello(
        &mut self,
        catalog: &MessageCatalog,
        config: &ClientConfig,
    ) -> Result<(), SendError> {
        let msg = catalog.get("Loginapp_hello").ok_or(SendError)?;
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
        config: &ClientConfig,
        account: &str,
        password: &str,
        datas: &[u8],
    ) -> Result<(), SendError> {
        let msg = catalog.get("Loginapp_login").ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.write_i8(config.client_type as i8);
        bundle.write_blob(datas);
        bundle.write_string(account);
        bundle.write_string(password);
        bundle.send(&mut self.transport)
    }

    pub fn create_account(
        &mut self,
        catalog: &MessageCatalog,
        account: &str,
        password: &str,
        datas: &[u8],
    ) -> Result<(), SendError> {
        let msg = catalog.get("Loginapp_reqCreateAccount").ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.write_string(account);
        bundle.write_string(password);
        bundle.write_blob(datas);
        bundle.send(&mut self.transport)
    }

    pub fn reset_password(
        &mut self,
        catalog: &MessageCatalog,
        account: &str,
    ) -> Result<(), SendError> {
        let msg = catalog
            .get("Loginapp_reqAccountResetPassword")
            .ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.write_string(account);
        bundle.send(&mut self.transport)
    }

    fn request_import_messages(&mut self, catalog: &MessageCatalog) -> Result<(), SendError> {
        let msg = catalog
            .get("Loginapp_importClientMessages")
            .ok_or(SendError)?;
        let mut bundle = Bundle::new();
        bundle.start_message(msg);
        bundle.send(&mut self.transport)
    }

    fn tick(&mut self, catalog: &MessageCatalog, signals: &mut Vec<LoginSignal>) {
        if !self.transport.valid() || !catalog.loginapp_imported() {
            return;
        }
        match self.heartbeat.poll() {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendTick => {
                if let Some(msg) = catalog.get("Loginapp_onClientActiveTick") {
                    let mut bundle = Bundle::new();
                    bundle.start_message(msg);
                    if bundle.send(&mut self.transport).is_err() {
                        debug!("tick to the login server dropped, link is closing");
                    }
                }
            }
            HeartbeatAction::TimedOut => {
                error!("login server stopped answering ticks, closing the link");
                self.transport.close();
                signals.push(LoginSignal::Lost);
            }
        }
    }

    // ---- handlers ---------------------------------------------------

    fn on_hello_cb(
        &mut self,
        stream: &mut ByteStream,
        catalog: &mut MessageCatalog,
        errors: &mut ServerErrorTable,
        cache: Option<&mut BlobCache>,
        signals: &mut Vec<LoginSignal>,
    ) -> Result<(), StreamError> {
        let server_version = stream.read_string()?;
        let server_script_version = stream.read_string()?;
        let proto_md5 = stream.read_string()?;
        let entitydef_md5 = stream.read_string()?;
        let ctype = stream.read_i32()?;

        debug!(
            "LoginSession::on_hello_cb: verInfo({}) scriptVersion({}) ctype({})",
            server_version, server_script_version, ctype
        );

        catalog.reset();
        errors.clear();

        let restored = match cache {
            Some(cache) => {
                cache.on_server_digest(ServerApp::LoginApp, &proto_md5, &entitydef_md5)
                    && restore_from_cache(cache, catalog, errors)
            }
            None => false,
        };

        if restored {
            debug!("login server protocol restored from the local cache");
            signals.push(LoginSignal::Ready);
        } else if self.request_import_messages(catalog).is_err() {
            error!("requesting the client message table failed");
        }
        Ok(())
    }

    fn on_version_not_match(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
        cache: Option<&mut BlobCache>,
        signals: &mut Vec<LoginSignal>,
    ) -> Result<(), StreamError> {
        let server_version = stream.read_string()?;
        error!(
            "login server version not match: client({}) server({})",
            config.client_version, server_version
        );
        if let Some(cache) = cache {
            cache.clear_all_message_files();
        }
        signals.push(LoginSignal::VersionMismatch { server_version });
        self.transport.close();
        Ok(())
    }

    fn on_script_version_not_match(
        &mut self,
        stream: &mut ByteStream,
        config: &ClientConfig,
        cache: Option<&mut BlobCache>,
        signals: &mut Vec<LoginSignal>,
    ) -> Result<(), StreamError> {
        let server_version = stream.read_string()?;
        error!(
            "login server script version not match: client({}) server({})",
            config.client_script_version, server_version
        );
        if let Some(cache) = cache {
            cache.clear_all_message_files();
        }
        signals.push(LoginSignal::ScriptVersionMismatch { server_version });
        self.transport.close();
        Ok(())
    }

    fn on_import_client_messages(
        &mut self,
        stream: &mut ByteStream,
        catalog: &mut MessageCatalog,
        cache: Option<&mut BlobCache>,
        signals: &mut Vec<LoginSignal>,
    ) -> Result<(), StreamError> {
        let payload = stream.remaining().to_vec();
        catalog.import_from_stream(stream, ServerApp::LoginApp)?;
        if let Some(cache) = cache {
            cache.write_loginapp_messages(&payload);
        }

        match catalog.get("Loginapp_importServerErrorsDescr") {
            Some(msg) => {
                let mut bundle = Bundle::new();
                bundle.start_message(msg);
                if bundle.send(&mut self.transport).is_err() {
                    debug!("error-table request dropped, link is closing");
                }
            }
            None => {
                // No descriptions on offer; codes resolve numerically.
                warn!("login server declares no Loginapp_importServerErrorsDescr");
                signals.push(LoginSignal::Ready);
            }
        }
        Ok(())
    }

    fn on_import_server_errors(
        &mut self,
        stream: &mut ByteStream,
        errors: &mut ServerErrorTable,
        cache: Option<&mut BlobCache>,
        signals: &mut Vec<LoginSignal>,
    ) -> Result<(), StreamError> {
        let payload = stream.remaining().to_vec();
        errors.import_from_stream(stream)?;
        if let Some(cache) = cache {
            cache.write_server_errors(&payload);
        }
        signals.push(LoginSignal::Ready);
        Ok(())
    }

    fn on_login_failed(
        &mut self,
        stream: &mut ByteStream,
        signals: &mut Vec<LoginSignal>,
    ) -> Result<(), StreamError> {
        let code = stream.read_u16()?;
        let datas = stream.read_blob()?;
        error!(
            "LoginSession::on_login_failed: failedcode({}), datas({})",
            code,
            datas.len()
        );
        signals.push(LoginSignal::LoginFailed { code, datas });
        Ok(())
    }

    fn on_login_successfully(
        &mut self,
        stream: &mut ByteStream,
        signals: &mut Vec<LoginSignal>,
    ) -> Result<(), StreamError> {
        let account = stream.read_string()?;
        let host = stream.read_string()?;
        let tcp_port = stream.read_u16()?;
        let udp_port = stream.read_u16()?;
        let datas = stream.read_blob()?;

        debug!(
            "LoginSession::on_login_successfully: accountName({}), addr({}:{}|{}), datas({})",
            account,
            host,
            tcp_port,
            udp_port,
            datas.len()
        );
        signals.push(LoginSignal::LoginOk {
            account,
            host,
            tcp_port,
            udp_port,
        });
        Ok(())
    }

    fn on_create_account_result(
        &mut self,
        stream: &mut ByteStream,
        signals: &mut Vec<LoginSignal>,
    ) -> Result<(), StreamError> {
        let code = stream.read_u16()?;
        let datas = stream.read_blob()?;
        if code != 0 {
            warn!(
                "LoginSession::on_create_account_result: create failed, code({})",
                code
            );
        } else {
            debug!("LoginSession::on_create_account_result: create ok");
        }
        signals.push(LoginSignal::AccountCreated { code, datas });
        Ok(())
    }

    fn on_reset_password_cb(
        &mut self,
        stream: &mut ByteStream,
        signals: &mut Vec<LoginSignal>,
    ) -> Result<(), StreamError> {
        let code = stream.read_u16()?;
        if code != 0 {
            error!(
                "LoginSession::on_reset_password_cb: reset failed, code({})",
                code
            );
        }
        signals.push(LoginSignal::PasswordReset { code });
        Ok(())
    }
}

/// Cached blobs only count when both load and import succeed. A partial
/// restore resets the tables so the wire import starts clean.
fn restore_from_cache(
    cache: &BlobCache,
    catalog: &mut MessageCatalog,
    errors: &mut ServerErrorTable,
) -> bool {
    let restored = (|| {
        let mut messages = cache.load_loginapp_messages()?;
        catalog
            .import_from_stream(&mut messages, ServerApp::LoginApp)
            .ok()?;
        let mut descr = cache.load_server_errors()?;
        errors.import_from_stream(&mut descr).ok()?;
        Some(())
    })();

    if restored.is_none() {
        catalog.reset();
        errors.clear();
        return false;
    }
    true
}
