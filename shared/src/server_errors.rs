use std::collections::HashMap;

use log::debug;

use crate::byte_stream::{ByteStream, StreamError};

// Client-side result codes. Server-defined codes are positive and arrive
// through `import_from_stream`.
pub const ERR_SUCCESS: i32 = 0;
pub const ERR_CONNECT_TO_LOGINAPP_FAULT: i32 = -1;
pub const ERR_CONNECT_TO_BASEAPP_FAULT: i32 = -2;
pub const ERR_VERSION_NOT_MATCH: i32 = -3;
pub const ERR_SCRIPT_VERSION_NOT_MATCH: i32 = -4;
pub const ERR_INVALID_NETWORK: i32 = -5;
pub const ERR_LOSE_SERVER_CONNECTED: i32 = -6;

const LOCAL_ERRORS: &[(i32, &str, &str)] = &[
    (
        ERR_CONNECT_TO_LOGINAPP_FAULT,
        "CONNECT_TO_LOGINAPP_FAULT",
        "unable to connect to the login server",
    ),
    (
        ERR_CONNECT_TO_BASEAPP_FAULT,
        "CONNECT_TO_BASEAPP_FAULT",
        "unable to connect to the gateway server",
    ),
    (
        ERR_VERSION_NOT_MATCH,
        "VERSION_NOT_MATCH",
        "client and server version mismatch",
    ),
    (
        ERR_SCRIPT_VERSION_NOT_MATCH,
        "SCRIPT_VERSION_NOT_MATCH",
        "client and server script version mismatch",
    ),
    (ERR_INVALID_NETWORK, "INVALID_NETWORK", "no network connection"),
    (
        ERR_LOSE_SERVER_CONNECTED,
        "LOSE_SERVER_CONNECTED",
        "connection to the server was lost",
    ),
];

struct ErrorEntry {
    name: String,
    descr: String,
}

/// Result-code directory: a fixed set of client-side codes plus whatever
/// the server describes at runtime.
pub struct ServerErrorTable {
    errors: HashMap<i32, ErrorEntry>,
    imported: bool,
}

impl Default for ServerErrorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerErrorTable {
    pub fn new() -> Self {
        let mut table = Self {
            errors: HashMap::new(),
            imported: false,
        };
        table.bind_local_errors();
        table
    }

    fn bind_local_errors(&mut self) {
        for (id, name, descr) in LOCAL_ERRORS {
            self.errors.insert(
                *id,
                ErrorEntry {
                    name: (*name).to_string(),
                    descr: (*descr).to_string(),
                },
            );
        }
    }

    /// Drops the server-described codes. Local codes are rebound and keep
    /// resolving.
    pub fn clear(&mut self) {
        self.errors.clear();
        self.imported = false;
        self.bind_local_errors();
    }

    pub fn imported(&self) -> bool {
        self.imported
    }

    /// Consumes an error-description blob from the server (or the local
    /// cache): `u16 count`, then count x `{u16 id, utf8 name, utf8 descr}`.
    pub fn import_from_stream(&mut self, stream: &mut ByteStream) -> Result<(), StreamError> {
        let mut count = stream.read_u16()?;

        while count > 0 {
            count -= 1;

            let id = stream.read_u16()? as i32;
            let name = stream.read_utf8()?;
            let descr = stream.read_utf8()?;

            debug!(
                "ServerErrorTable::import_from_stream: id={}, name={}, descr={}",
                id, name, descr
            );
            self.errors.insert(id, ErrorEntry { name, descr });
        }

        self.imported = true;
        Ok(())
    }

    pub fn error_name(&self, id: i32) -> String {
        match self.errors.get(&id) {
            Some(e) => e.name.clone(),
            None => format!("Unknown error code({})", id),
        }
    }

    pub fn error_descr(&self, id: i32) -> String {
        match self.errors.get(&id) {
            Some(e) => e.descr.clone(),
            None => format!("Unknown error code({})", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_codes_resolve() {
        let table = ServerErrorTable::new();
        assert_eq!(
            table.error_name(ERR_CONNECT_TO_LOGINAPP_FAULT),
            "CONNECT_TO_LOGINAPP_FAULT"
        );
        assert_eq!(
            table.error_descr(ERR_LOSE_SERVER_CONNECTED),
            "connection to the server was lost"
        );
        assert!(!table.imported());
    }

    #[test]
    fn unknown_code_is_formatted() {
        let table = ServerErrorTable::new();
        assert_eq!(table.error_name(42), "Unknown error code(42)");
        assert_eq!(table.error_name(ERR_SUCCESS), "Unknown error code(0)");
    }

    #[test]
    fn import_adds_server_codes() {
        let mut blob = ByteStream::new();
        blob.write_u16(2);
        blob.write_u16(1);
        blob.write_utf8("SERVER_ERR_SRV_NO_READY");
        blob.write_utf8("server not ready");
        blob.write_u16(5);
        blob.write_utf8("SERVER_ERR_NAME");
        blob.write_utf8("bad account name");

        let mut table = ServerErrorTable::new();
        table.import_from_stream(&mut blob).unwrap();

        assert!(table.imported());
        assert_eq!(table.error_name(1), "SERVER_ERR_SRV_NO_READY");
        assert_eq!(table.error_descr(5), "bad account name");
    }

    #[test]
    fn clear_keeps_locals_resolving() {
        let mut blob = ByteStream::new();
        blob.write_u16(1);
        blob.write_u16(1);
        blob.write_utf8("SERVER_ERR_SRV_NO_READY");
        blob.write_utf8("server not ready");

        let mut table = ServerErrorTable::new();
        table.import_from_stream(&mut blob).unwrap();
        table.clear();

        assert!(!table.imported());
        assert_eq!(table.error_name(1), "Unknown error code(1)");
        assert_eq!(
            table.error_name(ERR_VERSION_NOT_MATCH),
            "VERSION_NOT_MATCH"
        );
    }
}
