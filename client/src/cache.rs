//! File-backed cache of imported protocol blobs.
//!
//! Importing message tables and entity defs costs a server round trip per
//! blob, so they are cached on disk keyed by server identity and digest.
//! The server announces its digest during the hello handshake; only a
//! matching digest unlocks the cached copies. Payload file names embed the
//! digest they were written under, so a digest change orphans stale files
//! instead of overwriting them.
//!
//! Every filesystem failure here is soft: a broken cache means a slower
//! login, never a failed one.

use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, warn};

use kbe_shared::{ByteStream, ServerApp};

use crate::config::ClientConfig;

const PREFIX_LOGINAPP_DIGEST: &str = "kbengine.digest.loginapp.";
const PREFIX_LOGINAPP_MESSAGES: &str = "loginapp_clientMessages.";
const PREFIX_BASEAPP_DIGEST: &str = "kbengine.digest.baseapp.";
const PREFIX_BASEAPP_MESSAGES: &str = "baseapp_clientMessages.";
const PREFIX_SERVER_ERRORS: &str = "serverErrorsDescr.";
const PREFIX_ENTITY_DEF: &str = "clientEntityDef.";

pub struct BlobCache {
    root: PathBuf,
    /// `{client_version}.{client_script_version}.{host}.{port}`
    suffix: String,
    loginapp_digest: String,
    baseapp_digest: String,
    loginapp_match: bool,
    baseapp_match: bool,
}

impl BlobCache {
    pub fn new(root: PathBuf, config: &ClientConfig) -> BlobCache {
        let mut cache = BlobCache {
            root,
            suffix: format!(
                "{}.{}.{}.{}",
                config.client_version, config.client_script_version, config.host, config.port
            ),
            loginapp_digest: String::new(),
            baseapp_digest: String::new(),
            loginapp_match: false,
            baseapp_match: false,
        };
        cache.init_digests();
        cache
    }

    fn init_digests(&mut self) {
        if let Some(mut stream) = self.load_file(&format!("{PREFIX_LOGINAPP_DIGEST}{}", self.suffix))
        {
            if let Ok(digest) = stream.read_string() {
                self.loginapp_digest = digest;
            }
        }
        if let Some(mut stream) = self.load_file(&format!("{PREFIX_BASEAPP_DIGEST}{}", self.suffix))
        {
            if let Ok(digest) = stream.read_string() {
                self.baseapp_digest = digest;
            }
        }
    }

    /// Payload suffixes embed the digest the payload was imported under.
    fn loginapp_suffix(&self) -> String {
        format!("{}.{}", self.loginapp_digest, self.suffix)
    }

    fn baseapp_suffix(&self) -> String {
        format!("{}.{}", self.baseapp_digest, self.suffix)
    }

    /// Compares the digest the server just announced against the stored
    /// one. A match unlocks the cached blobs for that app; a mismatch
    /// records the new digest and drops the app's files, and the caller
    /// must reimport over the wire.
    pub fn on_server_digest(
        &mut self,
        app: ServerApp,
        proto_md5: &str,
        entitydef_md5: &str,
    ) -> bool {
        let remote = format!("{proto_md5}{entitydef_md5}");
        let (local, digest_prefix) = match app {
            ServerApp::LoginApp => {
                if self.loginapp_digest == remote {
                    self.loginapp_match = true;
                    return true;
                }
                let local = std::mem::replace(&mut self.loginapp_digest, remote.clone());
                self.clear_loginapp_files();
                (local, PREFIX_LOGINAPP_DIGEST)
            }
            ServerApp::BaseApp => {
                if self.baseapp_digest == remote {
                    self.baseapp_match = true;
                    return true;
                }
                let local = std::mem::replace(&mut self.baseapp_digest, remote.clone());
                self.clear_baseapp_files();
                (local, PREFIX_BASEAPP_DIGEST)
            }
        };

        debug!("cached digest ({local}) superseded by ({remote}), reimporting from the server");
        let mut stream = ByteStream::new();
        stream.write_string(&remote);
        self.write_file(&format!("{digest_prefix}{}", self.suffix), stream.written());
        false
    }

    pub fn load_loginapp_messages(&self) -> Option<ByteStream> {
        self.load_payload(
            self.loginapp_match,
            PREFIX_LOGINAPP_MESSAGES,
            &self.loginapp_suffix(),
            &self.loginapp_digest,
        )
    }

    pub fn load_server_errors(&self) -> Option<ByteStream> {
        self.load_payload(
            self.loginapp_match,
            PREFIX_SERVER_ERRORS,
            &self.loginapp_suffix(),
            &self.loginapp_digest,
        )
    }

    pub fn load_baseapp_messages(&self) -> Option<ByteStream> {
        self.load_payload(
            self.baseapp_match,
            PREFIX_BASEAPP_MESSAGES,
            &self.baseapp_suffix(),
            &self.baseapp_digest,
        )
    }

    pub fn load_entity_def(&self) -> Option<ByteStream> {
        self.load_payload(
            self.baseapp_match,
            PREFIX_ENTITY_DEF,
            &self.baseapp_suffix(),
            &self.baseapp_digest,
        )
    }

    pub fn write_loginapp_messages(&self, payload: &[u8]) {
        self.write_payload(
            PREFIX_LOGINAPP_MESSAGES,
            &self.loginapp_suffix(),
            &self.loginapp_digest,
            payload,
        );
    }

    pub fn write_server_errors(&self, payload: &[u8]) {
        self.write_payload(
            PREFIX_SERVER_ERRORS,
            &self.loginapp_suffix(),
            &self.loginapp_digest,
            payload,
        );
    }

    pub fn write_baseapp_messages(&self, payload: &[u8]) {
        self.write_payload(
            PREFIX_BASEAPP_MESSAGES,
            &self.baseapp_suffix(),
            &self.baseapp_digest,
            payload,
        );
    }

    pub fn write_entity_def(&self, payload: &[u8]) {
        self.write_payload(
            PREFIX_ENTITY_DEF,
            &self.baseapp_suffix(),
            &self.baseapp_digest,
            payload,
        );
    }

    /// Drops every cached file for the current server identity. Used when
    /// the server reports a version mismatch and all bets are off.
    pub fn clear_all_message_files(&self) {
        self.clear_loginapp_files();
        self.clear_baseapp_files();
    }

    fn clear_loginapp_files(&self) {
        self.delete_file(&format!("{PREFIX_LOGINAPP_DIGEST}{}", self.suffix));
        self.delete_file(&format!("{PREFIX_LOGINAPP_MESSAGES}{}", self.loginapp_suffix()));
        self.delete_file(&format!("{PREFIX_SERVER_ERRORS}{}", self.loginapp_suffix()));
    }

    fn clear_baseapp_files(&self) {
        self.delete_file(&format!("{PREFIX_BASEAPP_DIGEST}{}", self.suffix));
        self.delete_file(&format!("{PREFIX_BASEAPP_MESSAGES}{}", self.baseapp_suffix()));
        self.delete_file(&format!("{PREFIX_ENTITY_DEF}{}", self.baseapp_suffix()));
    }

    /// Returns the payload positioned right after the leading digest, or
    /// `None` when missing, locked, or written under another digest.
    fn load_payload(
        &self,
        matched: bool,
        prefix: &str,
        suffix: &str,
        digest: &str,
    ) -> Option<ByteStream> {
        if !matched {
            return None;
        }
        let mut stream = self.load_file(&format!("{prefix}{suffix}"))?;
        if stream.read_string().ok()? != digest {
            return None;
        }
        Some(stream)
    }

    fn write_payload(&self, prefix: &str, suffix: &str, digest: &str, payload: &[u8]) {
        let mut stream = ByteStream::new();
        stream.write_string(digest);
        stream.append(payload);
        self.write_file(&format!("{prefix}{suffix}"), stream.written());
    }

    fn load_file(&self, name: &str) -> Option<ByteStream> {
        let path = self.root.join(name);
        match fs::read(&path) {
            Ok(bytes) => {
                debug!("loaded cache file {}, {} bytes", path.display(), bytes.len());
                Some(ByteStream::from_bytes(&bytes))
            }
            Err(_) => None,
        }
    }

    fn write_file(&self, name: &str, bytes: &[u8]) {
        if let Err(err) = fs::create_dir_all(&self.root) {
            warn!("creating cache directory {} failed: {err}", self.root.display());
            return;
        }
        let path = self.root.join(name);
        debug!("writing cache file {}", path.display());
        if let Err(err) = fs::write(&path, bytes) {
            warn!("writing cache file {} failed: {err}", path.display());
        }
    }

    fn delete_file(&self, name: &str) {
        let path = self.root.join(name);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("removing cache file {} failed: {err}", path.display());
            }
        }
    }
}
