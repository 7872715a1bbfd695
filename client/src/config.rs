//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

/// What kind of client this process registers as when logging in. The
/// discriminant is sent as an i8 in the login request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ClientType {
    Mobile = 1,
    Win = 2,
    Linux = 3,
    Mac = 4,
    Browser = 5,
    Bots = 6,
    Mini = 7,
}

/// Knobs for a client instance. `Default` matches a stock local server
/// deployment; embedders override fields before constructing the runtime.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Login server address.
    pub host: String,
    pub port: u16,
    pub client_type: ClientType,
    /// Opaque blob forwarded in the hello handshake.
    pub network_encrypted_key: Vec<u8>,
    pub client_version: String,
    pub client_script_version: String,
    /// Directory for cached protocol blobs. `None` disables the cache.
    pub persistent_data_path: Option<PathBuf>,
    /// Stream the player's own movement back to the server.
    pub sync_player: bool,
    /// Accept one-byte entity ids for entities inside the view range.
    pub use_alias_entity_id: bool,
    /// Replay every client-visible property as a change event right after
    /// an entity is created.
    pub is_on_init_call_propertys_set_methods: bool,
    /// Stay on TCP even when the server offers a UDP port.
    pub force_disable_udp: bool,
    pub tcp_send_buffer_max: usize,
    pub tcp_recv_buffer_max: usize,
    pub udp_send_buffer_max: u16,
    pub udp_recv_buffer_max: u16,
    /// Interval between keep-alive ticks. Zero disables the heartbeat.
    pub server_heartbeat_tick: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 20013,
            client_type: ClientType::Mini,
            network_encrypted_key: Vec::new(),
            client_version: "1.3.8".to_string(),
            client_script_version: "0.1.0".to_string(),
            persistent_data_path: None,
            sync_player: true,
            use_alias_entity_id: true,
            is_on_init_call_propertys_set_methods: true,
            force_disable_udp: false,
            tcp_send_buffer_max: 65535,
            tcp_recv_buffer_max: 65535,
            udp_send_buffer_max: 128,
            udp_recv_buffer_max: 128,
            server_heartbeat_tick: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_a_local_loginapp() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 20013);
        assert_eq!(config.client_type as i8, 7);
        assert!(config.sync_player);
        assert!(config.use_alias_entity_id);
        assert!(!config.force_disable_udp);
        assert!(config.persistent_data_path.is_none());
        assert_eq!(config.server_heartbeat_tick, Duration::from_secs(15));
    }
}
