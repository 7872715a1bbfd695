use std::collections::HashMap;

use super::datatype::{TypeId, Value};

// Property distribution flags, as declared server-side.
pub const ED_FLAG_CELL_PUBLIC: u32 = 0x00000001;
pub const ED_FLAG_CELL_PRIVATE: u32 = 0x00000002;
pub const ED_FLAG_ALL_CLIENTS: u32 = 0x00000004;
pub const ED_FLAG_CELL_PUBLIC_AND_OWN: u32 = 0x00000008;
pub const ED_FLAG_OWN_CLIENT: u32 = 0x00000010;
pub const ED_FLAG_BASE_AND_CLIENT: u32 = 0x00000020;
pub const ED_FLAG_BASE: u32 = 0x00000040;
pub const ED_FLAG_OTHER_CLIENTS: u32 = 0x00000080;

/// One entity property as declared by the schema.
#[derive(Clone, Debug)]
pub struct PropertyDef {
    pub utype: u16,
    pub flags: u32,
    pub alias_id: i16,
    pub name: String,
    pub type_id: TypeId,
    pub default: Value,
}

impl PropertyDef {
    /// A base-side property: its set callback fires as soon as the entity
    /// is initialized, without waiting for the world.
    pub fn is_base(&self) -> bool {
        self.flags == ED_FLAG_BASE_AND_CLIENT || self.flags == ED_FLAG_BASE
    }

    pub fn is_owner_only(&self) -> bool {
        self.flags == ED_FLAG_CELL_PUBLIC_AND_OWN || self.flags == ED_FLAG_OWN_CLIENT
    }

    pub fn is_other_only(&self) -> bool {
        self.flags == ED_FLAG_OTHER_CLIENTS
    }
}

/// One entity method as declared by the schema.
#[derive(Clone, Debug)]
pub struct MethodDef {
    pub utype: u16,
    pub alias_id: i16,
    pub name: String,
    pub arg_types: Vec<TypeId>,
}

/// One entity class: its properties plus the client, base and cell method
/// tables.
///
/// The wire key of a property or client method depends on the class size:
/// collections of at most 255 entries are addressed by their one-byte alias
/// id, larger ones by the full u16 utype. Base and cell methods are only
/// ever called by name from this side.
pub struct ClassDef {
    name: String,
    utype: u16,
    use_property_alias: bool,
    use_method_alias: bool,
    properties: Vec<PropertyDef>,
    prop_by_name: HashMap<String, usize>,
    prop_by_key: HashMap<u16, usize>,
    client_methods: Vec<MethodDef>,
    client_by_name: HashMap<String, usize>,
    client_by_key: HashMap<u16, usize>,
    base_methods: Vec<MethodDef>,
    base_by_name: HashMap<String, usize>,
    cell_methods: Vec<MethodDef>,
    cell_by_name: HashMap<String, usize>,
}

impl ClassDef {
    pub(crate) fn new(
        name: String,
        utype: u16,
        use_property_alias: bool,
        use_method_alias: bool,
    ) -> Self {
        Self {
            name,
            utype,
            use_property_alias,
            use_method_alias,
            properties: Vec::new(),
            prop_by_name: HashMap::new(),
            prop_by_key: HashMap::new(),
            client_methods: Vec::new(),
            client_by_name: HashMap::new(),
            client_by_key: HashMap::new(),
            base_methods: Vec::new(),
            base_by_name: HashMap::new(),
            cell_methods: Vec::new(),
            cell_by_name: HashMap::new(),
        }
    }

    pub(crate) fn add_property(&mut self, prop: PropertyDef) {
        let key = if self.use_property_alias {
            prop.alias_id as u16
        } else {
            prop.utype
        };
        let index = self.properties.len();
        self.prop_by_name.insert(prop.name.clone(), index);
        self.prop_by_key.insert(key, index);
        self.properties.push(prop);
    }

    pub(crate) fn add_client_method(&mut self, method: MethodDef) {
        let key = if self.use_method_alias {
            method.alias_id as u16
        } else {
            method.utype
        };
        let index = self.client_methods.len();
        self.client_by_name.insert(method.name.clone(), index);
        self.client_by_key.insert(key, index);
        self.client_methods.push(method);
    }

    pub(crate) fn add_base_method(&mut self, method: MethodDef) {
        let index = self.base_methods.len();
        self.base_by_name.insert(method.name.clone(), index);
        self.base_methods.push(method);
    }

    pub(crate) fn add_cell_method(&mut self, method: MethodDef) {
        let index = self.cell_methods.len();
        self.cell_by_name.insert(method.name.clone(), index);
        self.cell_methods.push(method);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn utype(&self) -> u16 {
        self.utype
    }

    pub fn use_property_alias(&self) -> bool {
        self.use_property_alias
    }

    pub fn use_method_alias(&self) -> bool {
        self.use_method_alias
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.prop_by_name.get(name).map(|i| &self.properties[*i])
    }

    /// Resolves a property from its wire key (alias id or full utype).
    pub fn property_by_key(&self, key: u16) -> Option<&PropertyDef> {
        self.prop_by_key.get(&key).map(|i| &self.properties[*i])
    }

    pub fn client_method(&self, name: &str) -> Option<&MethodDef> {
        self.client_by_name
            .get(name)
            .map(|i| &self.client_methods[*i])
    }

    /// Resolves a client method from its wire key (alias id or full utype).
    pub fn client_method_by_key(&self, key: u16) -> Option<&MethodDef> {
        self.client_by_key
            .get(&key)
            .map(|i| &self.client_methods[*i])
    }

    pub fn base_method(&self, name: &str) -> Option<&MethodDef> {
        self.base_by_name.get(name).map(|i| &self.base_methods[*i])
    }

    pub fn cell_method(&self, name: &str) -> Option<&MethodDef> {
        self.cell_by_name.get(name).map(|i| &self.cell_methods[*i])
    }
}
