use std::collections::HashMap;

use log::{debug, error};

use crate::byte_stream::{ByteStream, StreamError};

pub type MessageId = u16;

// Bootstrap message ids, fixed by the engine protocol. Everything else is
// imported from the server at runtime.
pub const MSG_ID_LOGINAPP_HELLO: MessageId = 4;
pub const MSG_ID_LOGINAPP_IMPORT_CLIENT_MESSAGES: MessageId = 5;
pub const MSG_ID_BASEAPP_HELLO: MessageId = 200;
pub const MSG_ID_BASEAPP_IMPORT_CLIENT_MESSAGES: MessageId = 207;
pub const MSG_ID_BASEAPP_IMPORT_CLIENT_ENTITYDEF: MessageId = 208;
pub const MSG_ID_ON_IMPORT_CLIENT_MESSAGES: MessageId = 518;
pub const MSG_ID_ON_HELLO_CB: MessageId = 521;
pub const MSG_ID_ON_SCRIPT_VERSION_NOT_MATCH: MessageId = 522;
pub const MSG_ID_ON_VERSION_NOT_MATCH: MessageId = 523;

/// Which server process a connection (and its imported message space)
/// belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerApp {
    LoginApp,
    BaseApp,
}

/// How a message's body is consumed by its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgsKind {
    /// The handler takes the raw body stream.
    Raw,
    /// The body is a fixed argument list described by `arg_types`.
    Fixed,
}

impl ArgsKind {
    fn from_wire(v: i8) -> Self {
        if v < 0 {
            ArgsKind::Raw
        } else {
            ArgsKind::Fixed
        }
    }
}

/// One message definition: wire id, framing length and argument shape.
///
/// `length` semantics: `-1` = variable length carried as a u16 on the wire,
/// `0` = no body and no length field, `> 0` = fixed body length with no
/// length field.
#[derive(Clone, Debug)]
pub struct MessageDescriptor {
    pub id: MessageId,
    pub name: String,
    pub length: i16,
    pub args_kind: ArgsKind,
    pub arg_types: Vec<u8>,
}

impl MessageDescriptor {
    fn new(id: MessageId, name: &str, length: i16, args_kind: i8) -> Self {
        Self {
            id,
            name: name.to_string(),
            length,
            args_kind: ArgsKind::from_wire(args_kind),
            arg_types: Vec::new(),
        }
    }
}

/// Name- and id-addressable message definitions, split per server app.
///
/// Messages the client sends are looked up by name; messages the server
/// sends (names carrying `Client_`) are routed by id through the client
/// table the frame decoder consults.
pub struct MessageCatalog {
    by_name: HashMap<String, MessageDescriptor>,
    client_by_id: HashMap<MessageId, MessageDescriptor>,
    loginapp_by_id: HashMap<MessageId, MessageDescriptor>,
    baseapp_by_id: HashMap<MessageId, MessageDescriptor>,
    loginapp_imported: bool,
    baseapp_imported: bool,
}

impl Default for MessageCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCatalog {
    pub fn new() -> Self {
        let mut catalog = Self {
            by_name: HashMap::new(),
            client_by_id: HashMap::new(),
            loginapp_by_id: HashMap::new(),
            baseapp_by_id: HashMap::new(),
            loginapp_imported: false,
            baseapp_imported: false,
        };
        catalog.bind_fixed_messages();
        catalog
    }

    /// Drops every imported definition and rebinds the bootstrap set. The
    /// imported flags are left alone; they track the session flow and are
    /// cleared explicitly on disconnect.
    pub fn reset(&mut self) {
        self.by_name.clear();
        self.client_by_id.clear();
        self.loginapp_by_id.clear();
        self.baseapp_by_id.clear();
        self.bind_fixed_messages();
    }

    fn bind_fixed_messages(&mut self) {
        self.add_named(MessageDescriptor::new(
            MSG_ID_LOGINAPP_HELLO,
            "Loginapp_hello",
            -1,
            -1,
        ));
        self.add_named(MessageDescriptor::new(
            MSG_ID_LOGINAPP_IMPORT_CLIENT_MESSAGES,
            "Loginapp_importClientMessages",
            0,
            0,
        ));
        self.add_named(MessageDescriptor::new(
            MSG_ID_BASEAPP_HELLO,
            "Baseapp_hello",
            -1,
            -1,
        ));
        self.add_named(MessageDescriptor::new(
            MSG_ID_BASEAPP_IMPORT_CLIENT_MESSAGES,
            "Baseapp_importClientMessages",
            0,
            0,
        ));
        self.add_named(MessageDescriptor::new(
            MSG_ID_BASEAPP_IMPORT_CLIENT_ENTITYDEF,
            "Baseapp_importClientEntityDef",
            0,
            0,
        ));

        self.add_client(MessageDescriptor::new(
            MSG_ID_ON_HELLO_CB,
            "Client_onHelloCB",
            -1,
            -1,
        ));
        self.add_client(MessageDescriptor::new(
            MSG_ID_ON_SCRIPT_VERSION_NOT_MATCH,
            "Client_onScriptVersionNotMatch",
            -1,
            -1,
        ));
        self.add_client(MessageDescriptor::new(
            MSG_ID_ON_VERSION_NOT_MATCH,
            "Client_onVersionNotMatch",
            -1,
            -1,
        ));
        self.add_client(MessageDescriptor::new(
            MSG_ID_ON_IMPORT_CLIENT_MESSAGES,
            "Client_onImportClientMessages",
            -1,
            -1,
        ));
    }

    fn add_named(&mut self, msg: MessageDescriptor) {
        self.by_name.insert(msg.name.clone(), msg);
    }

    fn add_client(&mut self, msg: MessageDescriptor) {
        if !msg.name.is_empty() {
            self.by_name.insert(msg.name.clone(), msg.clone());
        }
        self.client_by_id.insert(msg.id, msg);
    }

    fn add_loginapp(&mut self, msg: MessageDescriptor) {
        if !msg.name.is_empty() {
            self.by_name.insert(msg.name.clone(), msg.clone());
        }
        self.loginapp_by_id.insert(msg.id, msg);
    }

    fn add_baseapp(&mut self, msg: MessageDescriptor) {
        if !msg.name.is_empty() {
            self.by_name.insert(msg.name.clone(), msg.clone());
        }
        self.baseapp_by_id.insert(msg.id, msg);
    }

    pub fn get(&self, name: &str) -> Option<&MessageDescriptor> {
        self.by_name.get(name)
    }

    /// The table the frame decoder resolves inbound ids against.
    pub fn client_message(&self, id: MessageId) -> Option<&MessageDescriptor> {
        self.client_by_id.get(&id)
    }

    pub fn loginapp_imported(&self) -> bool {
        self.loginapp_imported
    }

    pub fn baseapp_imported(&self) -> bool {
        self.baseapp_imported
    }

    pub fn set_loginapp_imported(&mut self, imported: bool) {
        self.loginapp_imported = imported;
    }

    pub fn set_baseapp_imported(&mut self, imported: bool) {
        self.baseapp_imported = imported;
    }

    /// Consumes a message-definition blob from the server (or the local
    /// cache). Definitions named with `Client_` join the inbound client
    /// table, everything else the outbound table of `from`.
    pub fn import_from_stream(
        &mut self,
        stream: &mut ByteStream,
        from: ServerApp,
    ) -> Result<(), StreamError> {
        let mut count = stream.read_u16()?;
        debug!("MessageCatalog::import_from_stream: {} definitions", count);

        while count > 0 {
            count -= 1;

            let id = stream.read_u16()?;
            let length = stream.read_i16()?;
            let name = stream.read_string()?;
            let args_kind = stream.read_i8()?;
            let arg_count = stream.read_u8()?;

            let mut arg_types = Vec::with_capacity(arg_count as usize);
            for _ in 0..arg_count {
                arg_types.push(stream.read_u8()?);
            }

            let mut msg = MessageDescriptor::new(id, &name, length, args_kind);
            msg.arg_types = arg_types;

            if name.contains("Client_") {
                self.add_client(msg);
            } else {
                match from {
                    ServerApp::LoginApp => self.add_loginapp(msg),
                    ServerApp::BaseApp => self.add_baseapp(msg),
                }
            }

            match from {
                ServerApp::LoginApp => self.loginapp_imported = true,
                ServerApp::BaseApp => self.baseapp_imported = true,
            }
        }

        if stream.length() > 0 {
            error!(
                "MessageCatalog::import_from_stream: {} trailing bytes after import",
                stream.length()
            );
        }

        Ok(())
    }
}
