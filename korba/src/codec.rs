use crate::cdr::{CdrReader, CdrWriter};
use crate::error::{marshal, CompletionStatus, Result, SystemException};
use crate::ior::Ior;
use crate::typecode::TypeCode;
use crate::value::Value;

fn mismatch(tc: &TypeCode, value: &Value) -> crate::error::OrbError {
    SystemException::bad_param(0, CompletionStatus::No).into_error(format!(
        "value {value:?} does not match TypeCode kind {}",
        tc.kind()
    ))
}

fn unsupported(tc: &TypeCode) -> crate::error::OrbError {
    SystemException::bad_typecode(0, CompletionStatus::No)
        .into_error(format!("kind {} has no dynamic wire mapping", tc.kind()))
}

/// Writes `value` according to `tc`. The caller must supply a TypeCode;
/// there is no wire form without one.
pub fn encode_value(tc: &TypeCode, value: &Value, w: &mut CdrWriter) -> Result<()> {
    match tc {
        TypeCode::Null | TypeCode::Void => match value {
            Value::Null | Value::Void => Ok(()),
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Short => match value {
            Value::Short(x) => {
                w.write_i16(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Long => match value {
            Value::Long(x) => {
                w.write_i32(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::LongLong => match value {
            Value::LongLong(x) => {
                w.write_i64(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::UShort => match value {
            Value::UShort(x) => {
                w.write_u16(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::ULong => match value {
            Value::ULong(x) => {
                w.write_u32(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::ULongLong => match value {
            Value::ULongLong(x) => {
                w.write_u64(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Float => match value {
            Value::Float(x) => {
                w.write_f32(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Double => match value {
            Value::Double(x) => {
                w.write_f64(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Boolean => match value {
            Value::Boolean(x) => {
                w.write_bool(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Char | TypeCode::Octet => match value {
            Value::Char(x) | Value::Octet(x) => {
                w.write_octet(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::WChar => match value {
            Value::WChar(x) => {
                w.write_wchar(*x);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::String(bound) => match value {
            Value::String(s) => {
                if *bound != 0 && s.len() as u32 > *bound {
                    return Err(mismatch(tc, value));
                }
                w.write_string(s);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::WString(bound) => match value {
            Value::WString(s) => {
                if *bound != 0 && s.encode_utf16().count() as u32 > *bound {
                    return Err(mismatch(tc, value));
                }
                w.write_wstring(s);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Enum { members, .. } => match value {
            Value::Enum(ordinal) => {
                if *ordinal as usize >= members.len() {
                    return Err(mismatch(tc, value));
                }
                w.write_u32(*ordinal);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Sequence(element, bound) => match value {
            Value::Sequence(items) => {
                if *bound != 0 && items.len() as u32 > *bound {
                    return Err(mismatch(tc, value));
                }
                w.write_u32(items.len() as u32);
                for item in items {
                    encode_value(element, item, w)?;
                }
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Array(element, len) => match value {
            Value::Array(items) if items.len() as u32 == *len => {
                for item in items {
                    encode_value(element, item, w)?;
                }
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Struct { members, .. } | TypeCode::Except { members, .. } => match value {
            Value::Struct(fields) if fields.len() == members.len() => {
                for (member, field) in members.iter().zip(fields) {
                    encode_value(&member.tc, field, w)?;
                }
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Union {
            discriminator,
            members,
            default_index,
            ..
        } => match value {
            Value::Union {
                discriminator: disc,
                value: inner,
            } => {
                encode_value(discriminator, disc, w)?;
                let label = disc.discriminant().ok_or_else(|| mismatch(tc, disc))?;
                let arm = members
                    .iter()
                    .enumerate()
                    .find(|(i, m)| m.label == label && Some(*i as u32) != *default_index)
                    .or_else(|| {
                        default_index
                            .and_then(|i| members.get(i as usize).map(|m| (i as usize, m)))
                    });
                match arm {
                    Some((_, member)) => encode_value(&member.tc, inner, w),
                    // implicit default: discriminator selects no arm
                    None => Ok(()),
                }
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Alias { inner, .. } => encode_value(inner, value, w),
        TypeCode::ObjRef { .. } => match value {
            Value::ObjRef(ior) => {
                ior.encode(w);
                Ok(())
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Any => match value {
            Value::Any(inner_tc, inner) => {
                inner_tc.encode(w)?;
                encode_value(inner_tc, inner, w)
            }
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::TypeCode => match value {
            Value::TypeCode(inner) => inner.encode(w),
            _ => Err(mismatch(tc, value)),
        },
        TypeCode::Principal
        | TypeCode::Fixed { .. }
        | TypeCode::LongDouble
        | TypeCode::Value { .. }
        | TypeCode::ValueBox { .. }
        | TypeCode::Native { .. }
        | TypeCode::AbstractInterface { .. }
        | TypeCode::LocalInterface { .. }
        | TypeCode::Component { .. } => Err(unsupported(tc)),
    }
}

/// Reads a value according to `tc`. A stream that does not match the
/// TypeCode surfaces as `MARSHAL`.
pub fn decode_value(tc: &TypeCode, r: &mut CdrReader<'_>) -> Result<Value> {
    Ok(match tc {
        TypeCode::Null => Value::Null,
        TypeCode::Void => Value::Void,
        TypeCode::Short => Value::Short(r.read_i16()?),
        TypeCode::Long => Value::Long(r.read_i32()?),
        TypeCode::LongLong => Value::LongLong(r.read_i64()?),
        TypeCode::UShort => Value::UShort(r.read_u16()?),
        TypeCode::ULong => Value::ULong(r.read_u32()?),
        TypeCode::ULongLong => Value::ULongLong(r.read_u64()?),
        TypeCode::Float => Value::Float(r.read_f32()?),
        TypeCode::Double => Value::Double(r.read_f64()?),
        TypeCode::Boolean => Value::Boolean(r.read_bool()?),
        TypeCode::Char => Value::Char(r.read_char()?),
        TypeCode::Octet => Value::Octet(r.read_octet()?),
        TypeCode::WChar => Value::WChar(r.read_wchar()?),
        TypeCode::String(bound) => {
            let s = r.read_string()?;
            if *bound != 0 && s.len() as u32 > *bound {
                return Err(marshal(format!(
                    "string of {} octets exceeds bound {bound}",
                    s.len()
                )));
            }
            Value::String(s)
        }
        TypeCode::WString(bound) => {
            let s = r.read_wstring()?;
            if *bound != 0 && s.encode_utf16().count() as u32 > *bound {
                return Err(marshal(format!("wstring exceeds bound {bound}")));
            }
            Value::WString(s)
        }
        TypeCode::Enum { members, .. } => {
            let ordinal = r.read_u32()?;
            if ordinal as usize >= members.len() {
                return Err(marshal(format!(
                    "enum ordinal {ordinal} out of range ({} members)",
                    members.len()
                )));
            }
            Value::Enum(ordinal)
        }
        TypeCode::Sequence(element, bound) => {
            let count = r.read_sequence_len()?;
            if *bound != 0 && count as u32 > *bound {
                return Err(marshal(format!("sequence of {count} exceeds bound {bound}")));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(element, r)?);
            }
            Value::Sequence(items)
        }
        TypeCode::Array(element, len) => {
            let mut items = Vec::with_capacity(*len as usize);
            for _ in 0..*len {
                items.push(decode_value(element, r)?);
            }
            Value::Array(items)
        }
        TypeCode::Struct { members, .. } | TypeCode::Except { members, .. } => {
            let mut fields = Vec::with_capacity(members.len());
            for member in members {
                fields.push(decode_value(&member.tc, r)?);
            }
            Value::Struct(fields)
        }
        TypeCode::Union {
            discriminator,
            members,
            default_index,
            ..
        } => {
            let disc = decode_value(discriminator, r)?;
            let label = disc
                .discriminant()
                .ok_or_else(|| marshal("union discriminator is not integral"))?;
            let arm = members
                .iter()
                .enumerate()
                .find(|(i, m)| m.label == label && Some(*i as u32) != *default_index)
                .or_else(|| {
                    default_index.and_then(|i| members.get(i as usize).map(|m| (i as usize, m)))
                });
            let value = match arm {
                Some((_, member)) => decode_value(&member.tc, r)?,
                None => Value::Void,
            };
            Value::Union {
                discriminator: Box::new(disc),
                value: Box::new(value),
            }
        }
        TypeCode::Alias { inner, .. } => decode_value(inner, r)?,
        TypeCode::ObjRef { .. } => Value::ObjRef(Ior::decode(r)?),
        TypeCode::Any => {
            let inner_tc = TypeCode::decode(r)?;
            let inner = decode_value(&inner_tc, r)?;
            Value::Any(Box::new(inner_tc), Box::new(inner))
        }
        TypeCode::TypeCode => Value::TypeCode(TypeCode::decode(r)?),
        TypeCode::Principal
        | TypeCode::Fixed { .. }
        | TypeCode::LongDouble
        | TypeCode::Value { .. }
        | TypeCode::ValueBox { .. }
        | TypeCode::Native { .. }
        | TypeCode::AbstractInterface { .. }
        | TypeCode::LocalInterface { .. }
        | TypeCode::Component { .. } => return Err(unsupported(tc)),
    })
}
