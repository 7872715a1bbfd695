//! # KBE Shared
//! Protocol-level building blocks shared with the kbe-client runtime: byte
//! streams with the packed coordinate codecs, the message catalog, the
//! incremental frame decoder, outgoing bundles, the entity schema registry
//! and the server error table.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod byte_stream;
mod bundle;
mod catalog;
mod frame;
mod pack;
mod schema;
mod server_errors;

pub use byte_stream::{ByteStream, StreamError, STREAM_BUFFER_MAX};
pub use bundle::{Bundle, SegmentSink, SendError};
pub use catalog::{
    ArgsKind, MessageCatalog, MessageDescriptor, MessageId, ServerApp, MSG_ID_BASEAPP_HELLO,
    MSG_ID_BASEAPP_IMPORT_CLIENT_ENTITYDEF, MSG_ID_BASEAPP_IMPORT_CLIENT_MESSAGES,
    MSG_ID_LOGINAPP_HELLO, MSG_ID_LOGINAPP_IMPORT_CLIENT_MESSAGES,
    MSG_ID_ON_HELLO_CB, MSG_ID_ON_IMPORT_CLIENT_MESSAGES, MSG_ID_ON_SCRIPT_VERSION_NOT_MATCH,
    MSG_ID_ON_VERSION_NOT_MATCH,
};
pub use frame::{DecodeProgress, Frame, FrameDecoder, FrameSink};
pub use pack::{
    pack_xz, pack_y, pack_xyz, unpack_xz, unpack_y, unpack_xyz, PACK_XYZ_DEFAULT_MIN,
};
pub use schema::{
    ClassDef, DataType, MethodDef, PropertyDef, SchemaError, SchemaRegistry, TypeId, Value,
    ED_FLAG_ALL_CLIENTS, ED_FLAG_BASE, ED_FLAG_BASE_AND_CLIENT, ED_FLAG_CELL_PRIVATE,
    ED_FLAG_CELL_PUBLIC, ED_FLAG_CELL_PUBLIC_AND_OWN, ED_FLAG_OTHER_CLIENTS, ED_FLAG_OWN_CLIENT,
    DATATYPE_ARRAY, DATATYPE_BLOB, DATATYPE_DOUBLE, DATATYPE_ENTITYCALL, DATATYPE_FIXED_DICT,
    DATATYPE_FLOAT, DATATYPE_INT16, DATATYPE_INT32, DATATYPE_INT64, DATATYPE_INT8,
    DATATYPE_PYTHON, DATATYPE_STRING, DATATYPE_UINT16, DATATYPE_UINT32, DATATYPE_UINT64,
    DATATYPE_UINT8, DATATYPE_UNICODE, DATATYPE_VECTOR2, DATATYPE_VECTOR3, DATATYPE_VECTOR4,
};
pub use server_errors::{
    ServerErrorTable, ERR_CONNECT_TO_BASEAPP_FAULT, ERR_CONNECT_TO_LOGINAPP_FAULT,
    ERR_INVALID_NETWORK, ERR_LOSE_SERVER_CONNECTED, ERR_SCRIPT_VERSION_NOT_MATCH, ERR_SUCCESS,
    ERR_VERSION_NOT_MATCH,
};
