//! # KBE Client
//! Client-side network runtime for KBEngine servers: background TCP and
//! KCP transports, the login and gateway sessions with their protocol
//! imports, and an entity world kept in sync by the server's property
//! and volatile-movement streams. The embedding game loop owns a
//! [`ClientRuntime`], calls [`ClientRuntime::process`] once per frame
//! and drains the typed event queue afterwards.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

pub use kbe_shared as shared;
pub use kbe_shared::{MessageCatalog, SchemaRegistry, ServerErrorTable, Value};

mod app;
mod cache;
mod config;
mod entity;
mod events;
mod gateway;
mod heartbeat;
mod login;
mod ring;
mod world;

pub mod math;
pub mod transport;

pub use app::ClientRuntime;
pub use cache::BlobCache;
pub use config::{ClientConfig, ClientType};
pub use entity::Entity;
pub use events::{ClientEvent, Events};
pub use gateway::{GatewayError, GatewaySession, GatewaySignal, RemoteCallError};
pub use login::{LoginSession, LoginSignal};
pub use world::{World, WorldError};
