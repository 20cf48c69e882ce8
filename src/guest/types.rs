//! Debug-type oracle: resolves kernel variables and structure layouts from
//! the DWARF information of the trusted binary, and navigates instances of
//! those structures inside guest memory.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use gimli::constants as dw;
use gimli::Reader;

use super::GuestMemory;
use crate::elf::ElfImage;
use crate::error::VerifyError;
use crate::prelude::*;

type EndianRcSlice = gimli::EndianRcSlice<gimli::LittleEndian>;

/// What a struct member is, as far as navigation needs to know.
#[derive(Debug, Clone)]
pub enum MemberKind {
    Scalar,
    /// Pointer, optionally to a named struct.
    Pointer(Option<String>),
    Struct(String),
    Array {
        elem_size: u64,
        elem_struct: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub kind: MemberKind,
}

#[derive(Debug, Clone)]
pub struct StructLayout {
    pub name: String,
    pub size: u64,
    pub members: Vec<Member>,
}

impl StructLayout {
    pub fn member(&self, name: &str) -> Result<&Member> {
        self.members
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| VerifyError::not_found(format!("member {}.{name}", self.name)).into())
    }

    pub fn member_offset(&self, name: &str) -> Result<u64> {
        Ok(self.member(name)?.offset)
    }
}

/// Structure-aware view of the guest's debug types.
pub trait TypeOracle: Send + Sync {
    /// Resolve a named global variable to an address plus type layout.
    fn variable(&self, name: &str) -> Result<Instance>;

    /// Resolve a struct descriptor by name.
    fn base_type(&self, name: &str) -> Result<Arc<StructLayout>>;

    fn function_address(&self, name: &str) -> Option<u64>;

    /// An instance of a named struct at an arbitrary address.
    fn instance_at(&self, struct_name: &str, address: u64) -> Result<Instance> {
        Ok(Instance {
            address,
            layout: Some(self.base_type(struct_name)?),
            member: None,
        })
    }
}

/// A typed location in guest memory.
#[derive(Clone)]
pub struct Instance {
    pub address: u64,
    layout: Option<Arc<StructLayout>>,
    /// set when this instance is a non-struct member (scalar/pointer/array)
    member: Option<Member>,
}

impl Instance {
    pub fn untyped(address: u64) -> Self {
        Instance {
            address,
            layout: None,
            member: None,
        }
    }

    pub fn layout(&self) -> Option<&Arc<StructLayout>> {
        self.layout.as_ref()
    }

    pub fn size(&self) -> u64 {
        match (&self.member, &self.layout) {
            (Some(member), _) => member.size,
            (None, Some(layout)) => layout.size,
            _ => 0,
        }
    }

    /// Navigate to a member. With `deref`, the member must be a pointer and
    /// the result is an instance of the pointed-to object.
    pub fn member(
        &self,
        oracle: &dyn TypeOracle,
        memory: &dyn GuestMemory,
        pid: i32,
        name: &str,
        deref: bool,
    ) -> Result<Instance> {
        let layout = self
            .layout
            .as_ref()
            .ok_or_else(|| anyhow!("member access on untyped instance"))?;
        let member = layout.member(name)?.clone();
        let address = self.address + member.offset;

        if deref {
            let MemberKind::Pointer(ref target) = member.kind else {
                bail!("member {}.{name} is not a pointer", layout.name);
            };
            let pointee = memory.read_u64(address, pid)?;
            let layout = match target {
                Some(struct_name) => Some(oracle.base_type(struct_name)?),
                None => None,
            };
            return Ok(Instance {
                address: pointee,
                layout,
                member: None,
            });
        }

        match &member.kind {
            MemberKind::Struct(struct_name) => Ok(Instance {
                address,
                layout: Some(oracle.base_type(struct_name)?),
                member: None,
            }),
            _ => Ok(Instance {
                address,
                layout: None,
                member: Some(member),
            }),
        }
    }

    pub fn array_elem(&self, oracle: &dyn TypeOracle, index: u64) -> Result<Instance> {
        let Some(member) = &self.member else {
            bail!("array access on non-member instance");
        };
        let MemberKind::Array {
            elem_size,
            elem_struct,
        } = &member.kind
        else {
            bail!("array access on non-array member {}", member.name);
        };
        let address = self.address + index * elem_size;
        match elem_struct {
            Some(struct_name) => Ok(Instance {
                address,
                layout: Some(oracle.base_type(struct_name)?),
                member: None,
            }),
            None => Ok(Instance {
                address,
                layout: None,
                member: Some(Member {
                    name: member.name.clone(),
                    offset: 0,
                    size: *elem_size,
                    kind: MemberKind::Scalar,
                }),
            }),
        }
    }

    pub fn value_u64(&self, memory: &dyn GuestMemory, pid: i32) -> Result<u64> {
        memory.read_u64(self.address, pid)
    }

    pub fn value_u32(&self, memory: &dyn GuestMemory, pid: i32) -> Result<u32> {
        memory.read_u32(self.address, pid)
    }

    pub fn value_i32(&self, memory: &dyn GuestMemory, pid: i32) -> Result<i32> {
        memory.read_i32(self.address, pid)
    }
}

// ---------------------------------------------------------------------------
// DWARF implementation

#[derive(Debug, Clone)]
enum RawKind {
    Base,
    Enum,
    Pointer,
    Alias,
    Struct,
    Array,
    Other,
}

#[derive(Debug, Clone)]
struct RawType {
    kind: RawKind,
    name: Option<String>,
    byte_size: Option<u64>,
    inner: Option<u64>,
    /// element count for arrays
    count: Option<u64>,
    members: Vec<RawMember>,
}

#[derive(Debug, Clone)]
struct RawMember {
    name: String,
    offset: u64,
    type_ref: Option<u64>,
}

/// Type oracle backed by the `.debug_info` of the kernel binary.
pub struct DwarfTypes {
    types: HashMap<u64, RawType>,
    structs: HashMap<String, u64>,
    variables: HashMap<String, (u64, Option<u64>)>,
    functions: HashMap<String, u64>,
    layout_cache: Mutex<HashMap<String, Arc<StructLayout>>>,
}

impl DwarfTypes {
    pub fn load(image: &ElfImage) -> Result<Self> {
        let load_section = |id: gimli::SectionId| -> std::result::Result<EndianRcSlice, gimli::Error> {
            let data = image
                .section_by_name(id.name())
                .map(|s| image.section_data(s))
                .unwrap_or(&[]);
            Ok(EndianRcSlice::new(Rc::from(data), gimli::LittleEndian))
        };

        let dwarf = gimli::Dwarf::load(load_section)?;

        let mut this = DwarfTypes {
            types: HashMap::new(),
            structs: HashMap::new(),
            variables: HashMap::new(),
            functions: HashMap::new(),
            layout_cache: Mutex::new(HashMap::new()),
        };

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            this.scan_unit(&dwarf, &unit)?;
        }

        // typedefs of anonymous structs (atomic_t, mm_context_t, ...) are
        // addressable by the typedef name
        let mut named_aliases = Vec::new();
        for ty in this.types.values() {
            if let (RawKind::Alias, Some(name), Some(inner)) = (&ty.kind, &ty.name, ty.inner) {
                if let Some((target_off, target)) = this.resolve_alias_entry(inner) {
                    if matches!(target.kind, RawKind::Struct) && target.name.is_none() {
                        named_aliases.push((name.clone(), target_off));
                    }
                }
            }
        }
        for (name, offset) in named_aliases {
            this.structs.entry(name).or_insert(offset);
        }

        info!(
            "debug types: {} structs, {} variables, {} functions",
            this.structs.len(),
            this.variables.len(),
            this.functions.len()
        );
        Ok(this)
    }

    fn scan_unit(
        &mut self,
        dwarf: &gimli::Dwarf<EndianRcSlice>,
        unit: &gimli::Unit<EndianRcSlice>,
    ) -> Result<()> {
        let mut entries = unit.entries();
        // stack of (depth, die offset) for member attachment
        let mut struct_stack: Vec<(isize, u64)> = Vec::new();
        let mut depth: isize = 0;

        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;
            while let Some(&(d, _)) = struct_stack.last() {
                if depth <= d {
                    struct_stack.pop();
                } else {
                    break;
                }
            }

            let Some(global_off) = entry
                .offset()
                .to_debug_info_offset(&unit.header)
                .map(|o| o.0 as u64)
            else {
                continue;
            };

            let name = self.entry_name(dwarf, unit, entry);

            match entry.tag() {
                dw::DW_TAG_base_type => {
                    self.types.insert(
                        global_off,
                        RawType {
                            kind: RawKind::Base,
                            name,
                            byte_size: self.entry_udata(entry, dw::DW_AT_byte_size),
                            inner: None,
                            count: None,
                            members: Vec::new(),
                        },
                    );
                }
                dw::DW_TAG_enumeration_type => {
                    self.types.insert(
                        global_off,
                        RawType {
                            kind: RawKind::Enum,
                            name,
                            byte_size: self.entry_udata(entry, dw::DW_AT_byte_size),
                            inner: None,
                            count: None,
                            members: Vec::new(),
                        },
                    );
                }
                dw::DW_TAG_pointer_type => {
                    self.types.insert(
                        global_off,
                        RawType {
                            kind: RawKind::Pointer,
                            name,
                            byte_size: Some(8),
                            inner: self.entry_type_ref(unit, entry),
                            count: None,
                            members: Vec::new(),
                        },
                    );
                }
                dw::DW_TAG_typedef
                | dw::DW_TAG_const_type
                | dw::DW_TAG_volatile_type
                | dw::DW_TAG_restrict_type => {
                    self.types.insert(
                        global_off,
                        RawType {
                            kind: RawKind::Alias,
                            name,
                            byte_size: None,
                            inner: self.entry_type_ref(unit, entry),
                            count: None,
                            members: Vec::new(),
                        },
                    );
                }
                dw::DW_TAG_structure_type | dw::DW_TAG_union_type => {
                    let declaration = matches!(
                        entry.attr_value(dw::DW_AT_declaration)?,
                        Some(gimli::AttributeValue::Flag(true))
                    );
                    self.types.insert(
                        global_off,
                        RawType {
                            kind: RawKind::Struct,
                            name: name.clone(),
                            byte_size: self.entry_udata(entry, dw::DW_AT_byte_size),
                            inner: None,
                            count: None,
                            members: Vec::new(),
                        },
                    );
                    if !declaration {
                        if let Some(name) = name {
                            self.structs.entry(name).or_insert(global_off);
                        }
                        struct_stack.push((depth, global_off));
                    }
                }
                dw::DW_TAG_array_type => {
                    self.types.insert(
                        global_off,
                        RawType {
                            kind: RawKind::Array,
                            name,
                            byte_size: self.entry_udata(entry, dw::DW_AT_byte_size),
                            inner: self.entry_type_ref(unit, entry),
                            count: None,
                            members: Vec::new(),
                        },
                    );
                    struct_stack.push((depth, global_off));
                }
                dw::DW_TAG_subrange_type => {
                    if let Some(&(d, parent)) = struct_stack.last() {
                        if depth == d + 1 {
                            let count = self
                                .entry_udata(entry, dw::DW_AT_count)
                                .or_else(|| {
                                    self.entry_udata(entry, dw::DW_AT_upper_bound)
                                        .map(|u| u + 1)
                                });
                            if let Some(parent_ty) = self.types.get_mut(&parent) {
                                if matches!(parent_ty.kind, RawKind::Array) {
                                    parent_ty.count = count;
                                }
                            }
                        }
                    }
                }
                dw::DW_TAG_member => {
                    if let Some(&(d, parent)) = struct_stack.last() {
                        if depth == d + 1 {
                            let offset = self
                                .entry_udata(entry, dw::DW_AT_data_member_location)
                                .unwrap_or(0);
                            let type_ref = self.entry_type_ref(unit, entry);
                            if let (Some(name), Some(parent_ty)) =
                                (name, self.types.get_mut(&parent))
                            {
                                parent_ty.members.push(RawMember {
                                    name,
                                    offset,
                                    type_ref,
                                });
                            }
                        }
                    }
                }
                dw::DW_TAG_variable => {
                    if let Some(name) = name {
                        if !self.variables.contains_key(&name) {
                            if let Some(address) = self.entry_static_address(entry)? {
                                let type_ref = self.entry_type_ref(unit, entry);
                                self.variables.insert(name, (address, type_ref));
                            }
                        }
                    }
                }
                dw::DW_TAG_subprogram => {
                    if let Some(name) = name {
                        if let Some(gimli::AttributeValue::Addr(low_pc)) =
                            entry.attr_value(dw::DW_AT_low_pc)?
                        {
                            self.functions.entry(name).or_insert(low_pc);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn entry_name(
        &self,
        dwarf: &gimli::Dwarf<EndianRcSlice>,
        unit: &gimli::Unit<EndianRcSlice>,
        entry: &gimli::DebuggingInformationEntry<EndianRcSlice>,
    ) -> Option<String> {
        let value = entry.attr_value(dw::DW_AT_name).ok()??;
        let name = dwarf.attr_string(unit, value).ok()?;
        Some(name.to_string_lossy().ok()?.into_owned())
    }

    fn entry_udata(
        &self,
        entry: &gimli::DebuggingInformationEntry<EndianRcSlice>,
        attr: gimli::DwAt,
    ) -> Option<u64> {
        entry.attr_value(attr).ok()??.udata_value()
    }

    fn entry_type_ref(
        &self,
        unit: &gimli::Unit<EndianRcSlice>,
        entry: &gimli::DebuggingInformationEntry<EndianRcSlice>,
    ) -> Option<u64> {
        match entry.attr_value(dw::DW_AT_type).ok()?? {
            gimli::AttributeValue::UnitRef(offset) => offset
                .to_debug_info_offset(&unit.header)
                .map(|o| o.0 as u64),
            gimli::AttributeValue::DebugInfoRef(offset) => Some(offset.0 as u64),
            _ => None,
        }
    }

    /// A variable's address if its location is a plain `DW_OP_addr`.
    fn entry_static_address(
        &self,
        entry: &gimli::DebuggingInformationEntry<EndianRcSlice>,
    ) -> Result<Option<u64>> {
        let Some(gimli::AttributeValue::Exprloc(expr)) =
            entry.attr_value(dw::DW_AT_location)?
        else {
            return Ok(None);
        };
        let mut reader = expr.0.clone();
        let Ok(op) = gimli::Reader::read_u8(&mut reader) else {
            return Ok(None);
        };
        if op != dw::DW_OP_addr.0 {
            return Ok(None);
        }
        match gimli::Reader::read_u64(&mut reader) {
            Ok(addr) => Ok(Some(addr)),
            Err(_) => Ok(None),
        }
    }

    /// Chase typedef/const/volatile chains to the underlying type.
    fn resolve_alias(&self, offset: u64) -> Option<&RawType> {
        self.resolve_alias_entry(offset).map(|(_, ty)| ty)
    }

    fn resolve_alias_entry(&self, mut offset: u64) -> Option<(u64, &RawType)> {
        for _ in 0..32 {
            let ty = self.types.get(&offset)?;
            match ty.kind {
                RawKind::Alias => offset = ty.inner?,
                _ => return Some((offset, ty)),
            }
        }
        None
    }

    /// Like `resolve_alias`, additionally reporting the innermost alias name
    /// crossed on the way (the navigable name of an anonymous struct).
    fn resolve_alias_named(&self, mut offset: u64) -> (Option<&RawType>, Option<String>) {
        let mut alias_name = None;
        for _ in 0..32 {
            let Some(ty) = self.types.get(&offset) else {
                return (None, alias_name);
            };
            match ty.kind {
                RawKind::Alias => {
                    if ty.name.is_some() {
                        alias_name = ty.name.clone();
                    }
                    match ty.inner {
                        Some(inner) => offset = inner,
                        None => return (None, alias_name),
                    }
                }
                _ => return (Some(ty), alias_name),
            }
        }
        (None, alias_name)
    }

    fn type_size(&self, offset: u64) -> u64 {
        let Some(ty) = self.resolve_alias(offset) else {
            return 0;
        };
        if let Some(size) = ty.byte_size {
            return size;
        }
        match ty.kind {
            RawKind::Pointer => 8,
            RawKind::Array => {
                let elem = ty.inner.map(|i| self.type_size(i)).unwrap_or(0);
                elem * ty.count.unwrap_or(0)
            }
            _ => 0,
        }
    }

    fn member_kind(&self, type_ref: Option<u64>) -> (MemberKind, u64) {
        let Some(offset) = type_ref else {
            return (MemberKind::Scalar, 0);
        };
        let size = self.type_size(offset);
        let (resolved, alias_name) = self.resolve_alias_named(offset);
        let Some(ty) = resolved else {
            return (MemberKind::Scalar, size);
        };
        let kind = match ty.kind {
            RawKind::Pointer => {
                let target = ty
                    .inner
                    .map(|i| self.resolve_alias_named(i))
                    .and_then(|(t, alias)| {
                        t.filter(|t| matches!(t.kind, RawKind::Struct))
                            .and_then(|t| t.name.clone().or(alias))
                    });
                MemberKind::Pointer(target)
            }
            RawKind::Struct => match ty.name.clone().or(alias_name) {
                Some(name) => MemberKind::Struct(name),
                None => MemberKind::Scalar,
            },
            RawKind::Array => {
                let elem = ty.inner.and_then(|i| self.resolve_alias(i));
                MemberKind::Array {
                    elem_size: ty.inner.map(|i| self.type_size(i)).unwrap_or(1).max(1),
                    elem_struct: elem
                        .filter(|t| matches!(t.kind, RawKind::Struct))
                        .and_then(|t| t.name.clone()),
                }
            }
            _ => MemberKind::Scalar,
        };
        (kind, size)
    }

    fn build_layout(&self, name: &str) -> Result<Arc<StructLayout>> {
        let &offset = self
            .structs
            .get(name)
            .ok_or_else(|| VerifyError::not_found(format!("type {name}")))?;
        let raw = &self.types[&offset];

        let members = raw
            .members
            .iter()
            .map(|member| {
                let (kind, size) = self.member_kind(member.type_ref);
                Member {
                    name: member.name.clone(),
                    offset: member.offset,
                    size,
                    kind,
                }
            })
            .collect();

        Ok(Arc::new(StructLayout {
            name: name.to_string(),
            size: raw.byte_size.unwrap_or(0),
            members,
        }))
    }
}

impl TypeOracle for DwarfTypes {
    fn variable(&self, name: &str) -> Result<Instance> {
        let &(address, type_ref) = self
            .variables
            .get(name)
            .ok_or_else(|| VerifyError::not_found(format!("variable {name}")))?;

        let mut instance = Instance::untyped(address);
        if let Some(ty) = type_ref.and_then(|t| self.resolve_alias(t)) {
            match (&ty.kind, &ty.name) {
                (RawKind::Struct, Some(struct_name)) => {
                    instance.layout = Some(self.base_type(struct_name)?);
                }
                _ => {
                    let (kind, size) = self.member_kind(type_ref);
                    instance.member = Some(Member {
                        name: name.to_string(),
                        offset: 0,
                        size,
                        kind,
                    });
                }
            }
        }
        Ok(instance)
    }

    fn base_type(&self, name: &str) -> Result<Arc<StructLayout>> {
        if let Some(layout) = self.layout_cache.lock().unwrap().get(name) {
            return Ok(layout.clone());
        }
        let layout = self.build_layout(name)?;
        self.layout_cache
            .lock()
            .unwrap()
            .insert(name.to_string(), layout.clone());
        Ok(layout)
    }

    fn function_address(&self, name: &str) -> Option<u64> {
        self.functions.get(name).copied()
    }
}
