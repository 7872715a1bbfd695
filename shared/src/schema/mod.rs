//! The entity schema: wire data types and entity class definitions, both
//! imported from the server (or the local cache) at connect time.

mod datatype;
mod module;

pub use datatype::{
    DataType, SchemaError, TypeId, Value, DATATYPE_ARRAY, DATATYPE_BLOB, DATATYPE_DOUBLE,
    DATATYPE_ENTITYCALL, DATATYPE_FIXED_DICT, DATATYPE_FLOAT, DATATYPE_INT16, DATATYPE_INT32,
    DATATYPE_INT64, DATATYPE_INT8, DATATYPE_PYTHON, DATATYPE_STRING, DATATYPE_UINT16,
    DATATYPE_UINT32, DATATYPE_UINT64, DATATYPE_UINT8, DATATYPE_UNICODE, DATATYPE_VECTOR2,
    DATATYPE_VECTOR3, DATATYPE_VECTOR4,
};
pub use module::{
    ClassDef, MethodDef, PropertyDef, ED_FLAG_ALL_CLIENTS, ED_FLAG_BASE, ED_FLAG_BASE_AND_CLIENT,
    ED_FLAG_CELL_PRIVATE, ED_FLAG_CELL_PUBLIC, ED_FLAG_CELL_PUBLIC_AND_OWN, ED_FLAG_OTHER_CLIENTS,
    ED_FLAG_OWN_CLIENT,
};

use std::collections::HashMap;

use log::debug;

use crate::bundle::Bundle;
use crate::byte_stream::ByteStream;

use datatype::TypeTable;

const BUILTIN_TYPES: &[(TypeId, DataType)] = &[
    (DATATYPE_STRING, DataType::String),
    (DATATYPE_UINT8, DataType::UInt8),
    (DATATYPE_UINT16, DataType::UInt16),
    (DATATYPE_UINT32, DataType::UInt32),
    (DATATYPE_UINT64, DataType::UInt64),
    (DATATYPE_INT8, DataType::Int8),
    (DATATYPE_INT16, DataType::Int16),
    (DATATYPE_INT32, DataType::Int32),
    (DATATYPE_INT64, DataType::Int64),
    (DATATYPE_PYTHON, DataType::Python),
    (DATATYPE_BLOB, DataType::Blob),
    (DATATYPE_UNICODE, DataType::Unicode),
    (DATATYPE_FLOAT, DataType::Float),
    (DATATYPE_DOUBLE, DataType::Double),
    (DATATYPE_VECTOR2, DataType::Vector2),
    (DATATYPE_VECTOR3, DataType::Vector3),
    (DATATYPE_VECTOR4, DataType::Vector4),
    (DATATYPE_ENTITYCALL, DataType::EntityCall),
];

// Names an alias may use as its base type. FIXED_DICT and ARRAY never
// appear here, they carry their own payload in the alias block.
const BUILTIN_NAMES: &[(&str, TypeId)] = &[
    ("STRING", DATATYPE_STRING),
    ("UINT8", DATATYPE_UINT8),
    ("UINT16", DATATYPE_UINT16),
    ("UINT32", DATATYPE_UINT32),
    ("UINT64", DATATYPE_UINT64),
    ("INT8", DATATYPE_INT8),
    ("INT16", DATATYPE_INT16),
    ("INT32", DATATYPE_INT32),
    ("INT64", DATATYPE_INT64),
    ("PYTHON", DATATYPE_PYTHON),
    ("PY_DICT", DATATYPE_PYTHON),
    ("PY_TUPLE", DATATYPE_PYTHON),
    ("PY_LIST", DATATYPE_PYTHON),
    ("BLOB", DATATYPE_BLOB),
    ("UNICODE", DATATYPE_UNICODE),
    ("FLOAT", DATATYPE_FLOAT),
    ("DOUBLE", DATATYPE_DOUBLE),
    ("VECTOR2", DATATYPE_VECTOR2),
    ("VECTOR3", DATATYPE_VECTOR3),
    ("VECTOR4", DATATYPE_VECTOR4),
    ("ENTITYCALL", DATATYPE_ENTITYCALL),
];

/// Holds every wire data type and entity class the server declared.
///
/// Starts out with the built-in types only; `import_from_stream` consumes
/// the schema blob the gateway sends (alias block, then class blocks until
/// the stream is empty).
pub struct SchemaRegistry {
    types: TypeTable,
    type_names: HashMap<String, TypeId>,
    classes: Vec<ClassDef>,
    class_by_name: HashMap<String, usize>,
    class_by_id: HashMap<u16, usize>,
    imported: bool,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        let mut types = TypeTable::new();
        for (id, ty) in BUILTIN_TYPES {
            types.insert(*id, ty.clone());
        }
        let mut type_names = HashMap::new();
        for (name, id) in BUILTIN_NAMES {
            type_names.insert((*name).to_string(), *id);
        }
        Self {
            types,
            type_names,
            classes: Vec::new(),
            class_by_name: HashMap::new(),
            class_by_id: HashMap::new(),
            imported: false,
        }
    }

    /// Back to the built-ins only.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn imported(&self) -> bool {
        self.imported
    }

    /// The imported flag tracks the session flow; the session layer clears
    /// it on disconnect so a reconnect imports again.
    pub fn set_imported(&mut self, imported: bool) {
        self.imported = imported;
    }

    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.class_by_name.get(name).map(|i| &self.classes[*i])
    }

    pub fn class_by_id(&self, utype: u16) -> Option<&ClassDef> {
        self.class_by_id.get(&utype).map(|i| &self.classes[*i])
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn data_type(&self, id: TypeId) -> Option<&DataType> {
        self.types.get(&id)
    }

    pub fn decode_value(
        &self,
        type_id: TypeId,
        stream: &mut ByteStream,
    ) -> Result<Value, SchemaError> {
        let ty = self
            .types
            .get(&type_id)
            .ok_or(SchemaError::UnknownType { id: type_id })?;
        ty.decode(&self.types, stream)
    }

    pub fn encode_value(
        &self,
        type_id: TypeId,
        bundle: &mut Bundle,
        v: &Value,
    ) -> Result<(), SchemaError> {
        let ty = self
            .types
            .get(&type_id)
            .ok_or(SchemaError::UnknownType { id: type_id })?;
        ty.encode(&self.types, bundle, v)
    }

    pub fn is_same_type(&self, type_id: TypeId, v: &Value) -> bool {
        match self.types.get(&type_id) {
            Some(ty) => ty.is_same_type(&self.types, v),
            None => false,
        }
    }

    /// Consumes the whole schema blob: the alias block first, then class
    /// blocks until the stream runs out.
    pub fn import_from_stream(&mut self, stream: &mut ByteStream) -> Result<(), SchemaError> {
        self.import_aliases(stream)?;

        while stream.length() > 0 {
            self.import_class(stream)?;
        }

        self.imported = true;
        Ok(())
    }

    fn import_aliases(&mut self, stream: &mut ByteStream) -> Result<(), SchemaError> {
        let mut count = stream.read_u16()?;
        debug!("SchemaRegistry::import_aliases: importAlias(size={})", count);

        while count > 0 {
            count -= 1;

            let utype = stream.read_u16()?;
            let name = stream.read_string()?;
            let mut alias = stream.read_string()?;

            // Anonymous types (e.g. an ARRAY used inline as a method
            // argument) come without a name; give them a unique one.
            if alias.is_empty() {
                alias = format!("Null_{}", utype);
            }

            debug!(
                "SchemaRegistry::import_aliases: importAlias({}:{}:{})",
                name, alias, utype
            );

            if name == "FIXED_DICT" {
                let mut key_count = stream.read_u8()?;
                let implemented_by = stream.read_string()?;
                let mut keys = Vec::with_capacity(key_count as usize);
                while key_count > 0 {
                    key_count -= 1;
                    let key = stream.read_string()?;
                    let key_type = stream.read_u16()?;
                    keys.push((key, key_type));
                }
                self.types.insert(
                    utype,
                    DataType::FixedDict {
                        implemented_by,
                        keys,
                    },
                );
            } else if name == "ARRAY" {
                let item = stream.read_u16()?;
                self.types.insert(utype, DataType::Array { item });
            } else {
                let base = self
                    .type_names
                    .get(&name)
                    .and_then(|id| self.types.get(id))
                    .cloned()
                    .ok_or_else(|| SchemaError::UnresolvedAlias {
                        name: alias.clone(),
                        base: name.clone(),
                    })?;
                self.types.insert(utype, base);
            }

            self.type_names.insert(alias, utype);
        }

        self.bind_types()
    }

    // FIXED_DICT keys and ARRAY items may reference aliases declared later
    // in the block, so resolvability is only checked once the block ends.
    fn bind_types(&mut self) -> Result<(), SchemaError> {
        let mut referenced = Vec::new();
        for ty in self.types.values() {
            match ty {
                DataType::FixedDict { keys, .. } => {
                    referenced.extend(keys.iter().map(|(_, id)| *id))
                }
                DataType::Array { item } => referenced.push(*item),
                _ => {}
            }
        }
        for id in referenced {
            if !self.types.contains_key(&id) {
                return Err(SchemaError::UnknownType { id });
            }
        }
        Ok(())
    }

    fn import_class(&mut self, stream: &mut ByteStream) -> Result<(), SchemaError> {
        let name = stream.read_string()?;
        let utype = stream.read_u16()?;
        let property_count = stream.read_u16()?;
        let client_method_count = stream.read_u16()?;
        let base_method_count = stream.read_u16()?;
        let cell_method_count = stream.read_u16()?;

        debug!(
            "SchemaRegistry::import_class: import({}), propertys({}), clientMethods({}), baseMethods({}), cellMethods({})",
            name, property_count, client_method_count, base_method_count, cell_method_count
        );

        let mut class = ClassDef::new(
            name,
            utype,
            property_count <= 255,
            client_method_count <= 255,
        );

        for _ in 0..property_count {
            let prop_utype = stream.read_u16()?;
            let flags = stream.read_u32()?;
            let alias_id = stream.read_i16()?;
            let prop_name = stream.read_string()?;
            let default_str = stream.read_string()?;
            let type_id = stream.read_u16()?;

            let ty = self
                .types
                .get(&type_id)
                .ok_or(SchemaError::UnknownType { id: type_id })?;
            let default = ty.default_value(&self.types, &default_str);

            class.add_property(PropertyDef {
                utype: prop_utype,
                flags,
                alias_id,
                name: prop_name,
                type_id,
                default,
            });
        }

        for _ in 0..client_method_count {
            let method = self.read_method(stream)?;
            class.add_client_method(method);
        }
        for _ in 0..base_method_count {
            let method = self.read_method(stream)?;
            class.add_base_method(method);
        }
        for _ in 0..cell_method_count {
            let method = self.read_method(stream)?;
            class.add_cell_method(method);
        }

        let index = self.classes.len();
        self.class_by_name.insert(class.name().to_string(), index);
        self.class_by_id.insert(utype, index);
        self.classes.push(class);
        Ok(())
    }

    fn read_method(&self, stream: &mut ByteStream) -> Result<MethodDef, SchemaError> {
        let utype = stream.read_u16()?;
        let alias_id = stream.read_i16()?;
        let name = stream.read_string()?;
        let mut arg_count = stream.read_u8()?;

        let mut arg_types = Vec::with_capacity(arg_count as usize);
        while arg_count > 0 {
            arg_count -= 1;
            let type_id = stream.read_u16()?;
            if !self.types.contains_key(&type_id) {
                return Err(SchemaError::UnknownType { id: type_id });
            }
            arg_types.push(type_id);
        }

        Ok(MethodDef {
            utype,
            alias_id,
            name,
            arg_types,
        })
    }
}
