use crate::cdr::{CdrReader, CdrWriter};
use crate::error::{marshal, CompletionStatus, Result, SystemException};

/// A struct, exception or valuetype member.
#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    pub name: String,
    pub tc: TypeCode,
}

/// A union arm. The label is the discriminator value selecting it, widened
/// to i64 (booleans are 0/1, chars their octet, enums their ordinal).
#[derive(Clone, Debug, PartialEq)]
pub struct UnionMember {
    pub label: i64,
    pub name: String,
    pub tc: TypeCode,
}

/// Runtime description of a CORBA type. Drives the dynamic codec; complex
/// kinds carry their parameters inline, nested descriptions are boxed.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeCode {
    Null,
    Void,
    Short,
    Long,
    UShort,
    ULong,
    Float,
    Double,
    Boolean,
    Char,
    Octet,
    Any,
    TypeCode,
    Principal,
    ObjRef {
        id: String,
        name: String,
    },
    Struct {
        id: String,
        name: String,
        members: Vec<Member>,
    },
    Union {
        id: String,
        name: String,
        discriminator: Box<TypeCode>,
        members: Vec<UnionMember>,
        default_index: Option<u32>,
    },
    Enum {
        id: String,
        name: String,
        members: Vec<String>,
    },
    /// Bound, 0 = unbounded.
    String(u32),
    Sequence(Box<TypeCode>, u32),
    Array(Box<TypeCode>, u32),
    Alias {
        id: String,
        name: String,
        inner: Box<TypeCode>,
    },
    Except {
        id: String,
        name: String,
        members: Vec<Member>,
    },
    LongLong,
    ULongLong,
    LongDouble,
    WChar,
    WString(u32),
    Fixed {
        digits: u16,
        scale: i16,
    },
    Value {
        id: String,
        name: String,
        members: Vec<Member>,
    },
    ValueBox {
        id: String,
        name: String,
        inner: Box<TypeCode>,
    },
    Native {
        id: String,
        name: String,
    },
    AbstractInterface {
        id: String,
        name: String,
    },
    LocalInterface {
        id: String,
        name: String,
    },
    Component {
        id: String,
        name: String,
    },
}

const TC_INDIRECTION: u32 = 0xFFFF_FFFF;
const MAX_TYPECODE_DEPTH: usize = 64;

fn bad_param(detail: impl Into<String>) -> crate::error::OrbError {
    SystemException::bad_param(0, CompletionStatus::No).into_error(detail)
}

impl TypeCode {
    /// The base CORBA Object reference type.
    pub fn object() -> TypeCode {
        TypeCode::ObjRef {
            id: "IDL:omg.org/CORBA/Object:1.0".to_string(),
            name: "Object".to_string(),
        }
    }

    /// The TCKind ordinal used on the wire.
    pub fn kind(&self) -> u32 {
        match self {
            TypeCode::Null => 0,
            TypeCode::Void => 1,
            TypeCode::Short => 2,
            TypeCode::Long => 3,
            TypeCode::UShort => 4,
            TypeCode::ULong => 5,
            TypeCode::Float => 6,
            TypeCode::Double => 7,
            TypeCode::Boolean => 8,
            TypeCode::Char => 9,
            TypeCode::Octet => 10,
            TypeCode::Any => 11,
            TypeCode::TypeCode => 12,
            TypeCode::Principal => 13,
            TypeCode::ObjRef { .. } => 14,
            TypeCode::Struct { .. } => 15,
            TypeCode::Union { .. } => 16,
            TypeCode::Enum { .. } => 17,
            TypeCode::String(_) => 18,
            TypeCode::Sequence(_, _) => 19,
            TypeCode::Array(_, _) => 20,
            TypeCode::Alias { .. } => 21,
            TypeCode::Except { .. } => 22,
            TypeCode::LongLong => 23,
            TypeCode::ULongLong => 24,
            TypeCode::LongDouble => 25,
            TypeCode::WChar => 26,
            TypeCode::WString(_) => 27,
            TypeCode::Fixed { .. } => 28,
            TypeCode::Value { .. } => 29,
            TypeCode::ValueBox { .. } => 30,
            TypeCode::Native { .. } => 31,
            TypeCode::AbstractInterface { .. } => 32,
            TypeCode::LocalInterface { .. } => 33,
            TypeCode::Component { .. } => 34,
        }
    }

    pub fn id(&self) -> Result<&str> {
        match self {
            TypeCode::ObjRef { id, .. }
            | TypeCode::Struct { id, .. }
            | TypeCode::Union { id, .. }
            | TypeCode::Enum { id, .. }
            | TypeCode::Alias { id, .. }
            | TypeCode::Except { id, .. }
            | TypeCode::Value { id, .. }
            | TypeCode::ValueBox { id, .. }
            | TypeCode::Native { id, .. }
            | TypeCode::AbstractInterface { id, .. }
            | TypeCode::LocalInterface { id, .. }
            | TypeCode::Component { id, .. } => Ok(id),
            _ => Err(bad_param(format!("kind {} has no repository id", self.kind()))),
        }
    }

    pub fn name(&self) -> Result<&str> {
        match self {
            TypeCode::ObjRef { name, .. }
            | TypeCode::Struct { name, .. }
            | TypeCode::Union { name, .. }
            | TypeCode::Enum { name, .. }
            | TypeCode::Alias { name, .. }
            | TypeCode::Except { name, .. }
            | TypeCode::Value { name, .. }
            | TypeCode::ValueBox { name, .. }
            | TypeCode::Native { name, .. }
            | TypeCode::AbstractInterface { name, .. }
            | TypeCode::LocalInterface { name, .. }
            | TypeCode::Component { name, .. } => Ok(name),
            _ => Err(bad_param(format!("kind {} has no name", self.kind()))),
        }
    }

    pub fn member_count(&self) -> Result<u32> {
        match self {
            TypeCode::Struct { members, .. }
            | TypeCode::Except { members, .. }
            | TypeCode::Value { members, .. } => Ok(members.len() as u32),
            TypeCode::Union { members, .. } => Ok(members.len() as u32),
            TypeCode::Enum { members, .. } => Ok(members.len() as u32),
            _ => Err(bad_param(format!("kind {} has no members", self.kind()))),
        }
    }

    pub fn member_name(&self, index: u32) -> Result<&str> {
        let out_of_range = || bad_param(format!("member index {index} out of range"));
        match self {
            TypeCode::Struct { members, .. }
            | TypeCode::Except { members, .. }
            | TypeCode::Value { members, .. } => members
                .get(index as usize)
                .map(|m| m.name.as_str())
                .ok_or_else(out_of_range),
            TypeCode::Union { members, .. } => members
                .get(index as usize)
                .map(|m| m.name.as_str())
                .ok_or_else(out_of_range),
            TypeCode::Enum { members, .. } => members
                .get(index as usize)
                .map(|m| m.as_str())
                .ok_or_else(out_of_range),
            _ => Err(bad_param(format!("kind {} has no members", self.kind()))),
        }
    }

    pub fn member_type(&self, index: u32) -> Result<&TypeCode> {
        let out_of_range = || bad_param(format!("member index {index} out of range"));
        match self {
            TypeCode::Struct { members, .. }
            | TypeCode::Except { members, .. }
            | TypeCode::Value { members, .. } => members
                .get(index as usize)
                .map(|m| &m.tc)
                .ok_or_else(out_of_range),
            TypeCode::Union { members, .. } => members
                .get(index as usize)
                .map(|m| &m.tc)
                .ok_or_else(out_of_range),
            _ => Err(bad_param(format!("kind {} has no member types", self.kind()))),
        }
    }

    pub fn member_label(&self, index: u32) -> Result<i64> {
        match self {
            TypeCode::Union { members, .. } => members
                .get(index as usize)
                .map(|m| m.label)
                .ok_or_else(|| bad_param(format!("member index {index} out of range"))),
            _ => Err(bad_param(format!("kind {} has no member labels", self.kind()))),
        }
    }

    pub fn discriminator_type(&self) -> Result<&TypeCode> {
        match self {
            TypeCode::Union { discriminator, .. } => Ok(discriminator),
            _ => Err(bad_param(format!("kind {} has no discriminator", self.kind()))),
        }
    }

    pub fn default_index(&self) -> Result<i32> {
        match self {
            TypeCode::Union { default_index, .. } => {
                Ok(default_index.map(|i| i as i32).unwrap_or(-1))
            }
            _ => Err(bad_param(format!("kind {} has no default index", self.kind()))),
        }
    }

    /// Bound of a string/wstring/sequence, or length of an array.
    pub fn length(&self) -> Result<u32> {
        match self {
            TypeCode::String(bound) | TypeCode::WString(bound) => Ok(*bound),
            TypeCode::Sequence(_, bound) => Ok(*bound),
            TypeCode::Array(_, len) => Ok(*len),
            _ => Err(bad_param(format!("kind {} has no length", self.kind()))),
        }
    }

    pub fn content_type(&self) -> Result<&TypeCode> {
        match self {
            TypeCode::Sequence(inner, _) | TypeCode::Array(inner, _) => Ok(inner),
            TypeCode::Alias { inner, .. } | TypeCode::ValueBox { inner, .. } => Ok(inner),
            _ => Err(bad_param(format!("kind {} has no content type", self.kind()))),
        }
    }

    pub fn fixed_digits(&self) -> Result<u16> {
        match self {
            TypeCode::Fixed { digits, .. } => Ok(*digits),
            _ => Err(bad_param(format!("kind {} has no digits", self.kind()))),
        }
    }

    pub fn fixed_scale(&self) -> Result<i16> {
        match self {
            TypeCode::Fixed { scale, .. } => Ok(*scale),
            _ => Err(bad_param(format!("kind {} has no scale", self.kind()))),
        }
    }

    /// Resolves through alias chains to the underlying type.
    pub fn strip_alias(&self) -> &TypeCode {
        match self {
            TypeCode::Alias { inner, .. } => inner.strip_alias(),
            _ => self,
        }
    }

    /// Structural equivalence ignoring aliases.
    pub fn equivalent(&self, other: &TypeCode) -> bool {
        self.strip_alias() == other.strip_alias()
    }

    pub fn encode(&self, w: &mut CdrWriter) -> Result<()> {
        w.write_u32(self.kind());
        match self {
            TypeCode::Null
            | TypeCode::Void
            | TypeCode::Short
            | TypeCode::Long
            | TypeCode::UShort
            | TypeCode::ULong
            | TypeCode::Float
            | TypeCode::Double
            | TypeCode::Boolean
            | TypeCode::Char
            | TypeCode::Octet
            | TypeCode::Any
            | TypeCode::TypeCode
            | TypeCode::Principal
            | TypeCode::LongLong
            | TypeCode::ULongLong
            | TypeCode::LongDouble
            | TypeCode::WChar => {}
            TypeCode::String(bound) | TypeCode::WString(bound) => w.write_u32(*bound),
            TypeCode::Fixed { digits, scale } => {
                w.write_u16(*digits);
                w.write_i16(*scale);
            }
            TypeCode::ObjRef { id, name }
            | TypeCode::Native { id, name }
            | TypeCode::AbstractInterface { id, name }
            | TypeCode::LocalInterface { id, name }
            | TypeCode::Component { id, name } => {
                w.write_encapsulation(|e| {
                    e.write_string(id);
                    e.write_string(name);
                    Ok(())
                })?;
            }
            TypeCode::Struct { id, name, members }
            | TypeCode::Except { id, name, members }
            | TypeCode::Value { id, name, members } => {
                w.write_encapsulation(|e| {
                    e.write_string(id);
                    e.write_string(name);
                    e.write_u32(members.len() as u32);
                    for member in members {
                        e.write_string(&member.name);
                        member.tc.encode(e)?;
                    }
                    Ok(())
                })?;
            }
            TypeCode::Union {
                id,
                name,
                discriminator,
                members,
                default_index,
            } => {
                w.write_encapsulation(|e| {
                    e.write_string(id);
                    e.write_string(name);
                    discriminator.encode(e)?;
                    e.write_i32(default_index.map(|i| i as i32).unwrap_or(-1));
                    e.write_u32(members.len() as u32);
                    for (i, member) in members.iter().enumerate() {
                        if Some(i as u32) == *default_index {
                            // default arm carries a placeholder zero octet label
                            e.write_octet(0);
                        } else {
                            encode_label(discriminator, member.label, e)?;
                        }
                        e.write_string(&member.name);
                        member.tc.encode(e)?;
                    }
                    Ok(())
                })?;
            }
            TypeCode::Enum { id, name, members } => {
                w.write_encapsulation(|e| {
                    e.write_string(id);
                    e.write_string(name);
                    e.write_u32(members.len() as u32);
                    for member in members {
                        e.write_string(member);
                    }
                    Ok(())
                })?;
            }
            TypeCode::Sequence(inner, bound) | TypeCode::Array(inner, bound) => {
                w.write_encapsulation(|e| {
                    inner.encode(e)?;
                    e.write_u32(*bound);
                    Ok(())
                })?;
            }
            TypeCode::Alias { id, name, inner } | TypeCode::ValueBox { id, name, inner } => {
                w.write_encapsulation(|e| {
                    e.write_string(id);
                    e.write_string(name);
                    inner.encode(e)?;
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    pub fn decode(r: &mut CdrReader<'_>) -> Result<TypeCode> {
        Self::decode_at(r, 0)
    }

    fn decode_at(r: &mut CdrReader<'_>, depth: usize) -> Result<TypeCode> {
        if depth > MAX_TYPECODE_DEPTH {
            return Err(marshal("TypeCode nesting too deep"));
        }
        let kind = r.read_u32()?;
        if kind == TC_INDIRECTION {
            // recursive TypeCodes (valuetype graphs) are out of scope
            return Err(marshal("indirected TypeCode not supported"));
        }
        Ok(match kind {
            0 => TypeCode::Null,
            1 => TypeCode::Void,
            2 => TypeCode::Short,
            3 => TypeCode::Long,
            4 => TypeCode::UShort,
            5 => TypeCode::ULong,
            6 => TypeCode::Float,
            7 => TypeCode::Double,
            8 => TypeCode::Boolean,
            9 => TypeCode::Char,
            10 => TypeCode::Octet,
            11 => TypeCode::Any,
            12 => TypeCode::TypeCode,
            13 => TypeCode::Principal,
            14 | 31 | 32 | 33 | 34 => {
                let mut e = r.read_encapsulation()?;
                let id = e.read_string()?;
                let name = e.read_string()?;
                match kind {
                    14 => TypeCode::ObjRef { id, name },
                    31 => TypeCode::Native { id, name },
                    32 => TypeCode::AbstractInterface { id, name },
                    33 => TypeCode::LocalInterface { id, name },
                    _ => TypeCode::Component { id, name },
                }
            }
            15 | 22 | 29 => {
                let mut e = r.read_encapsulation()?;
                let id = e.read_string()?;
                let name = e.read_string()?;
                let count = e.read_u32()?;
                let mut members = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    let member_name = e.read_string()?;
                    let tc = Self::decode_at(&mut e, depth + 1)?;
                    members.push(Member {
                        name: member_name,
                        tc,
                    });
                }
                match kind {
                    15 => TypeCode::Struct { id, name, members },
                    22 => TypeCode::Except { id, name, members },
                    _ => TypeCode::Value { id, name, members },
                }
            }
            16 => {
                let mut e = r.read_encapsulation()?;
                let id = e.read_string()?;
                let name = e.read_string()?;
                let discriminator = Box::new(Self::decode_at(&mut e, depth + 1)?);
                let raw_default = e.read_i32()?;
                let default_index = u32::try_from(raw_default).ok();
                let count = e.read_u32()?;
                let mut members = Vec::with_capacity(count.min(4096) as usize);
                for i in 0..count {
                    let label = if Some(i) == default_index {
                        e.read_octet()? as i64
                    } else {
                        decode_label(&discriminator, &mut e)?
                    };
                    let member_name = e.read_string()?;
                    let tc = Self::decode_at(&mut e, depth + 1)?;
                    members.push(UnionMember {
                        label,
                        name: member_name,
                        tc,
                    });
                }
                TypeCode::Union {
                    id,
                    name,
                    discriminator,
                    members,
                    default_index,
                }
            }
            17 => {
                let mut e = r.read_encapsulation()?;
                let id = e.read_string()?;
                let name = e.read_string()?;
                let count = e.read_u32()?;
                let mut members = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    members.push(e.read_string()?);
                }
                TypeCode::Enum { id, name, members }
            }
            18 => TypeCode::String(r.read_u32()?),
            19 | 20 => {
                let mut e = r.read_encapsulation()?;
                let inner = Box::new(Self::decode_at(&mut e, depth + 1)?);
                let bound = e.read_u32()?;
                if kind == 19 {
                    TypeCode::Sequence(inner, bound)
                } else {
                    TypeCode::Array(inner, bound)
                }
            }
            21 | 30 => {
                let mut e = r.read_encapsulation()?;
                let id = e.read_string()?;
                let name = e.read_string()?;
                let inner = Box::new(Self::decode_at(&mut e, depth + 1)?);
                if kind == 21 {
                    TypeCode::Alias { id, name, inner }
                } else {
                    TypeCode::ValueBox { id, name, inner }
                }
            }
            23 => TypeCode::LongLong,
            24 => TypeCode::ULongLong,
            25 => TypeCode::LongDouble,
            26 => TypeCode::WChar,
            27 => TypeCode::WString(r.read_u32()?),
            28 => {
                let digits = r.read_u16()?;
                let scale = r.read_i16()?;
                TypeCode::Fixed { digits, scale }
            }
            x => return Err(marshal(format!("unknown TCKind {x}"))),
        })
    }
}

fn encode_label(discriminator: &TypeCode, label: i64, w: &mut CdrWriter) -> Result<()> {
    match discriminator.strip_alias() {
        TypeCode::Short => w.write_i16(label as i16),
        TypeCode::Long => w.write_i32(label as i32),
        TypeCode::LongLong => w.write_i64(label),
        TypeCode::UShort => w.write_u16(label as u16),
        TypeCode::ULong | TypeCode::Enum { .. } => w.write_u32(label as u32),
        TypeCode::ULongLong => w.write_u64(label as u64),
        TypeCode::Boolean => w.write_bool(label != 0),
        TypeCode::Char | TypeCode::Octet => w.write_octet(label as u8),
        other => {
            return Err(bad_param(format!(
                "kind {} is not a valid union discriminator",
                other.kind()
            )))
        }
    }
    Ok(())
}

fn decode_label(discriminator: &TypeCode, r: &mut CdrReader<'_>) -> Result<i64> {
    Ok(match discriminator.strip_alias() {
        TypeCode::Short => r.read_i16()? as i64,
        TypeCode::Long => r.read_i32()? as i64,
        TypeCode::LongLong => r.read_i64()?,
        TypeCode::UShort => r.read_u16()? as i64,
        TypeCode::ULong | TypeCode::Enum { .. } => r.read_u32()? as i64,
        TypeCode::ULongLong => r.read_u64()? as i64,
        TypeCode::Boolean => r.read_bool()? as i64,
        TypeCode::Char | TypeCode::Octet => r.read_octet()? as i64,
        other => {
            return Err(marshal(format!(
                "kind {} is not a valid union discriminator",
                other.kind()
            )))
        }
    })
}
