//! Imports a server entity schema end to end and runs values through the
//! imported types in both directions.

use kbe_shared::{
    ArgsKind, Bundle, ByteStream, MessageDescriptor, SchemaRegistry, SegmentSink, SendError,
    Value, DATATYPE_INT32, DATATYPE_UINT16, DATATYPE_UNICODE, ED_FLAG_ALL_CLIENTS,
    ED_FLAG_BASE_AND_CLIENT, ED_FLAG_OWN_CLIENT,
};

const TYPE_ITEM_LIST: u16 = 30;
const TYPE_ITEM: u16 = 31;
const TYPE_DBID: u16 = 32;
const TYPE_INFO: u16 = 33;

struct CollectSink {
    segments: Vec<Vec<u8>>,
}

impl SegmentSink for CollectSink {
    fn send_segment(&mut self, data: &[u8]) -> Result<(), SendError> {
        self.segments.push(data.to_vec());
        Ok(())
    }
}

fn write_alias_header(s: &mut ByteStream, utype: u16, base: &str, alias: &str) {
    s.write_u16(utype);
    s.write_string(base);
    s.write_string(alias);
}

fn write_property(
    s: &mut ByteStream,
    utype: u16,
    flags: u32,
    alias_id: i16,
    name: &str,
    default: &str,
    type_id: u16,
) {
    s.write_u16(utype);
    s.write_u32(flags);
    s.write_i16(alias_id);
    s.write_string(name);
    s.write_string(default);
    s.write_u16(type_id);
}

fn write_method(s: &mut ByteStream, utype: u16, alias_id: i16, name: &str, args: &[u16]) {
    s.write_u16(utype);
    s.write_i16(alias_id);
    s.write_string(name);
    s.write_u8(args.len() as u8);
    for a in args {
        s.write_u16(*a);
    }
}

// A schema the size of a small game: an array alias declared before the
// dict it holds, a plain rename, a dict nesting another alias, and two
// entity classes.
fn schema_blob() -> ByteStream {
    let mut s = ByteStream::new();

    s.write_u16(4);
    write_alias_header(&mut s, TYPE_ITEM_LIST, "ARRAY", "ITEM_LIST");
    s.write_u16(TYPE_ITEM);
    write_alias_header(&mut s, TYPE_ITEM, "FIXED_DICT", "ITEM");
    s.write_u8(2);
    s.write_string("");
    s.write_string("itemID");
    s.write_u16(DATATYPE_INT32);
    s.write_string("count");
    s.write_u16(DATATYPE_UINT16);
    write_alias_header(&mut s, TYPE_DBID, "UINT64", "DBID");
    write_alias_header(&mut s, TYPE_INFO, "FIXED_DICT", "INFO");
    s.write_u8(2);
    s.write_string("");
    s.write_string("name");
    s.write_u16(DATATYPE_UNICODE);
    s.write_string("items");
    s.write_u16(TYPE_ITEM_LIST);

    s.write_string("Avatar");
    s.write_u16(1);
    s.write_u16(3);
    s.write_u16(2);
    s.write_u16(1);
    s.write_u16(1);
    write_property(&mut s, 40001, ED_FLAG_ALL_CLIENTS, 0, "name", "", DATATYPE_UNICODE);
    write_property(&mut s, 40002, ED_FLAG_BASE_AND_CLIENT, 1, "hp", "100", DATATYPE_INT32);
    write_property(&mut s, 40003, ED_FLAG_OWN_CLIENT, 2, "bag", "", TYPE_ITEM_LIST);
    write_method(&mut s, 30001, 0, "onAddItem", &[TYPE_ITEM]);
    write_method(&mut s, 30002, 1, "onNotice", &[DATATYPE_UNICODE]);
    write_method(&mut s, 30003, -1, "reqUseItem", &[DATATYPE_INT32]);
    write_method(&mut s, 30004, -1, "jump", &[]);

    s.write_string("Monster");
    s.write_u16(2);
    s.write_u16(1);
    s.write_u16(0);
    s.write_u16(0);
    s.write_u16(0);
    write_property(&mut s, 41001, ED_FLAG_ALL_CLIENTS, 0, "hp", "0", DATATYPE_INT32);

    s
}

fn imported_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    let mut blob = schema_blob();
    registry.import_from_stream(&mut blob).unwrap();
    registry
}

#[test]
fn both_classes_and_their_methods_come_through() {
    let registry = imported_registry();

    assert!(registry.imported());
    assert_eq!(registry.class_count(), 2);

    let avatar = registry.class("Avatar").unwrap();
    assert_eq!(avatar.client_method_by_key(0).unwrap().name, "onAddItem");
    assert_eq!(avatar.base_method("reqUseItem").unwrap().arg_types, vec![DATATYPE_INT32]);
    assert!(avatar.cell_method("jump").unwrap().arg_types.is_empty());

    let monster = registry.class_by_id(2).unwrap();
    assert_eq!(monster.name(), "Monster");
    assert_eq!(monster.properties().len(), 1);
}

#[test]
fn defaults_materialize_from_their_strings() {
    let registry = imported_registry();
    let avatar = registry.class("Avatar").unwrap();

    assert_eq!(avatar.property("hp").unwrap().default, Value::Int32(100));
    assert_eq!(
        avatar.property("name").unwrap().default,
        Value::String(String::new())
    );
    assert_eq!(avatar.property("bag").unwrap().default, Value::Array(Vec::new()));
}

#[test]
fn imported_array_of_dicts_decodes_a_server_body() {
    let registry = imported_registry();

    let mut body = ByteStream::new();
    body.write_u32(2);
    body.write_i32(1001);
    body.write_u16(3);
    body.write_i32(1002);
    body.write_u16(1);

    let value = registry.decode_value(TYPE_ITEM_LIST, &mut body).unwrap();
    assert_eq!(
        value,
        Value::Array(vec![
            Value::Dict(vec![
                ("itemID".to_string(), Value::Int32(1001)),
                ("count".to_string(), Value::UInt16(3)),
            ]),
            Value::Dict(vec![
                ("itemID".to_string(), Value::Int32(1002)),
                ("count".to_string(), Value::UInt16(1)),
            ]),
        ])
    );
}

#[test]
fn alias_nested_in_dict_decodes_recursively() {
    let registry = imported_registry();

    let mut body = ByteStream::new();
    body.write_utf8("tavern keeper");
    body.write_u32(1);
    body.write_i32(7);
    body.write_u16(12);

    let value = registry.decode_value(TYPE_INFO, &mut body).unwrap();
    match value {
        Value::Dict(fields) => {
            assert_eq!(fields[0].0, "name");
            assert_eq!(fields[0].1, Value::String("tavern keeper".to_string()));
            match &fields[1].1 {
                Value::Array(items) => assert_eq!(items.len(), 1),
                other => panic!("expected array, got {:?}", other),
            }
        }
        other => panic!("expected dict, got {:?}", other),
    }
}

#[test]
fn encoding_through_a_bundle_matches_the_wire_shape() {
    let registry = imported_registry();

    let desc = MessageDescriptor {
        id: 11001,
        name: "Baseapp_reqRestoreItem".to_string(),
        length: -1,
        args_kind: ArgsKind::Fixed,
        arg_types: Vec::new(),
    };

    let dict = Value::Dict(vec![
        ("itemID".to_string(), Value::Int32(1001)),
        ("count".to_string(), Value::UInt16(3)),
    ]);

    let mut bundle = Bundle::new();
    bundle.start_message(&desc);
    registry.encode_value(TYPE_ITEM, &mut bundle, &dict).unwrap();
    registry
        .encode_value(DATATYPE_UNICODE, &mut bundle, &Value::String("hi".to_string()))
        .unwrap();

    let mut sink = CollectSink { segments: Vec::new() };
    assert!(bundle.send(&mut sink).is_ok());

    let mut expected = Vec::new();
    expected.extend_from_slice(&11001u16.to_le_bytes());
    expected.extend_from_slice(&12u16.to_le_bytes());
    expected.extend_from_slice(&1001i32.to_le_bytes());
    expected.extend_from_slice(&3u16.to_le_bytes());
    expected.extend_from_slice(&2u32.to_le_bytes());
    expected.extend_from_slice(b"hi");

    assert_eq!(sink.segments, vec![expected]);
}

#[test]
fn renamed_scalar_keeps_its_base_behavior() {
    let registry = imported_registry();

    let mut body = ByteStream::new();
    body.write_u64(987654321);

    let value = registry.decode_value(TYPE_DBID, &mut body).unwrap();
    assert_eq!(value, Value::UInt64(987654321));
    assert!(registry.is_same_type(TYPE_DBID, &Value::UInt32(1)));
    assert!(!registry.is_same_type(TYPE_DBID, &Value::Int32(-1)));
    assert!(!registry.is_same_type(TYPE_ITEM, &Value::Array(Vec::new())));
}
