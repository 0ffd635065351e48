use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, trace};

use crate::cdr::{ByteOrder, CdrReader, CdrWriter};
use crate::error::{CompletionStatus, OrbError, Result, SystemException, UserException};
use crate::ior::Ior;
use crate::object::ObjectRef;
use crate::poa::{Poa, Servant};

pub const NAMING_CONTEXT_ID: &str = "IDL:omg.org/CosNaming/NamingContext:1.0";
pub const NOT_FOUND_ID: &str = "IDL:omg.org/CosNaming/NamingContext/NotFound:1.0";
pub const CANNOT_PROCEED_ID: &str = "IDL:omg.org/CosNaming/NamingContext/CannotProceed:1.0";
pub const INVALID_NAME_ID: &str = "IDL:omg.org/CosNaming/NamingContext/InvalidName:1.0";
pub const ALREADY_BOUND_ID: &str = "IDL:omg.org/CosNaming/NamingContext/AlreadyBound:1.0";
pub const NOT_EMPTY_ID: &str = "IDL:omg.org/CosNaming/NamingContext/NotEmpty:1.0";

/// One step of a compound name; `kind` is free-form metadata ("Service",
/// "Object", ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NameComponent {
    pub id: String,
    pub kind: String,
}

impl NameComponent {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> NameComponent {
        NameComponent {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

pub type Name = Vec<NameComponent>;

/// Parses the stringified form: components separated by `/`, id and kind by
/// `.`, with `\` escaping any of the three.
pub fn parse_name(s: &str) -> Result<Name> {
    if s.is_empty() {
        return Err(invalid_name());
    }
    let mut name = Vec::new();
    let mut id = String::new();
    let mut kind = String::new();
    let mut in_kind = false;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('.' | '/' | '\\')) => {
                    if in_kind {
                        kind.push(escaped);
                    } else {
                        id.push(escaped);
                    }
                }
                _ => return Err(invalid_name()),
            },
            '.' => {
                if in_kind {
                    return Err(invalid_name());
                }
                in_kind = true;
            }
            '/' => {
                if id.is_empty() && kind.is_empty() {
                    return Err(invalid_name());
                }
                name.push(NameComponent::new(
                    std::mem::take(&mut id),
                    std::mem::take(&mut kind),
                ));
                in_kind = false;
            }
            c => {
                if in_kind {
                    kind.push(c);
                } else {
                    id.push(c);
                }
            }
        }
    }
    if id.is_empty() && kind.is_empty() {
        return Err(invalid_name());
    }
    name.push(NameComponent::new(id, kind));
    Ok(name)
}

pub fn format_name(name: &[NameComponent]) -> String {
    fn escape(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            if matches!(c, '.' | '/' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }
    name.iter()
        .map(|c| {
            if c.kind.is_empty() {
                escape(&c.id)
            } else {
                format!("{}.{}", escape(&c.id), escape(&c.kind))
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn encode_name(name: &[NameComponent], w: &mut CdrWriter) {
    w.write_u32(name.len() as u32);
    for component in name {
        w.write_string(&component.id);
        w.write_string(&component.kind);
    }
}

pub fn decode_name(r: &mut CdrReader<'_>) -> Result<Name> {
    let count = r.read_sequence_len()?;
    let mut name = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let id = r.read_string()?;
        let kind = r.read_string()?;
        name.push(NameComponent { id, kind });
    }
    Ok(name)
}

fn invalid_name() -> OrbError {
    OrbError::User(UserException::new(INVALID_NAME_ID, Vec::new()))
}

/// Typed client stub over a remote naming context.
#[derive(Clone, Debug)]
pub struct NamingContext {
    object: ObjectRef,
}

impl NamingContext {
    /// Wraps without a type probe; use `narrow` to verify.
    pub fn from_object(object: ObjectRef) -> NamingContext {
        NamingContext { object }
    }

    /// Narrows via an explicit `_is_a` probe.
    pub async fn narrow(object: ObjectRef) -> Result<NamingContext> {
        if object.is_a(NAMING_CONTEXT_ID).await? {
            Ok(NamingContext { object })
        } else {
            Err(SystemException::bad_param(0, CompletionStatus::No)
                .into_error("object is not a NamingContext"))
        }
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    fn writer(&self) -> CdrWriter {
        let options = self.object.orb().options();
        CdrWriter::with_giop_minor(options.byte_order, options.giop_minor)
    }

    pub async fn bind(&self, name: &[NameComponent], object: &ObjectRef) -> Result<()> {
        let mut w = self.writer();
        encode_name(name, &mut w);
        object.ior().encode(&mut w);
        self.object
            .orb()
            .invoke_with_encoded(&self.object, "bind", w.into_bytes())
            .await?;
        Ok(())
    }

    pub async fn rebind(&self, name: &[NameComponent], object: &ObjectRef) -> Result<()> {
        let mut w = self.writer();
        encode_name(name, &mut w);
        object.ior().encode(&mut w);
        self.object
            .orb()
            .invoke_with_encoded(&self.object, "rebind", w.into_bytes())
            .await?;
        Ok(())
    }

    pub async fn bind_context(
        &self,
        name: &[NameComponent],
        context: &NamingContext,
    ) -> Result<()> {
        let mut w = self.writer();
        encode_name(name, &mut w);
        context.object.ior().encode(&mut w);
        self.object
            .orb()
            .invoke_with_encoded(&self.object, "bind_context", w.into_bytes())
            .await?;
        Ok(())
    }

    pub async fn bind_new_context(&self, name: &[NameComponent]) -> Result<NamingContext> {
        let mut w = self.writer();
        encode_name(name, &mut w);
        let reply = self
            .object
            .orb()
            .invoke_with_encoded(&self.object, "bind_new_context", w.into_bytes())
            .await?;
        let ior = Ior::decode(&mut reply.reader())?;
        Ok(NamingContext {
            object: self.object.orb().object_from_ior(ior),
        })
    }

    pub async fn resolve(&self, name: &[NameComponent]) -> Result<ObjectRef> {
        let mut w = self.writer();
        encode_name(name, &mut w);
        let reply = self
            .object
            .orb()
            .invoke_with_encoded(&self.object, "resolve", w.into_bytes())
            .await?;
        let ior = Ior::decode(&mut reply.reader())?;
        Ok(self.object.orb().object_from_ior(ior))
    }

    pub async fn resolve_str(&self, name: &str) -> Result<ObjectRef> {
        self.resolve(&parse_name(name)?).await
    }

    pub async fn unbind(&self, name: &[NameComponent]) -> Result<()> {
        let mut w = self.writer();
        encode_name(name, &mut w);
        self.object
            .orb()
            .invoke_with_encoded(&self.object, "unbind", w.into_bytes())
            .await?;
        Ok(())
    }
}

enum Binding {
    Object(Ior),
    Context {
        ior: Ior,
        /// Present for subcontexts living in this process; absent for
        /// foreign contexts bound by reference.
        local: Option<Arc<NamingServant>>,
    },
}

enum NamingFault {
    NotFound { why: u32, rest: Name },
    CannotProceed { rest: Name },
    AlreadyBound,
    NotEmpty,
    InvalidName,
}

pub const NOT_FOUND_MISSING_NODE: u32 = 0;
pub const NOT_FOUND_NOT_CONTEXT: u32 = 1;
pub const NOT_FOUND_NOT_OBJECT: u32 = 2;

impl NamingFault {
    fn into_user_exception(self, order: ByteOrder, minor: u8) -> OrbError {
        let mut w = CdrWriter::with_giop_minor(order, minor);
        let id = match self {
            NamingFault::NotFound { why, rest } => {
                w.write_u32(why);
                encode_name(&rest, &mut w);
                NOT_FOUND_ID
            }
            NamingFault::CannotProceed { rest } => {
                // the context objref slot stays nil: the caller re-resolves
                Ior::nil().encode(&mut w);
                encode_name(&rest, &mut w);
                CANNOT_PROCEED_ID
            }
            NamingFault::AlreadyBound => ALREADY_BOUND_ID,
            NamingFault::NotEmpty => NOT_EMPTY_ID,
            NamingFault::InvalidName => INVALID_NAME_ID,
        };
        OrbError::User(UserException::new(id, w.into_bytes()))
    }
}

/// In-process naming graph servant. Subcontexts made through
/// `bind_new_context` are activated in the same POA and resolved locally;
/// compound traversal through a foreign context reports `CannotProceed`.
pub struct NamingServant {
    poa: Mutex<Weak<Poa>>,
    bindings: Mutex<IndexMap<(String, String), Binding>>,
}

impl NamingServant {
    pub fn new() -> Arc<NamingServant> {
        Arc::new(NamingServant {
            poa: Mutex::new(Weak::new()),
            bindings: Mutex::new(IndexMap::new()),
        })
    }

    /// Creates a root context, activates it in `poa` under `key` and returns
    /// its reference.
    pub fn activate(poa: &Arc<Poa>, key: &[u8]) -> Result<(Arc<NamingServant>, Ior)> {
        let servant = NamingServant::new();
        *servant.poa.lock().unwrap() = Arc::downgrade(poa);
        poa.activate_object_with_id(key, servant.clone())?;
        let ior = poa.create_reference_with_id(key, NAMING_CONTEXT_ID)?;
        Ok((servant, ior))
    }

    fn poa(&self) -> Result<Arc<Poa>> {
        self.poa.lock().unwrap().upgrade().ok_or_else(|| {
            SystemException::obj_adapter(0, CompletionStatus::No)
                .into_error("naming context is detached from its POA")
        })
    }

    fn key(component: &NameComponent) -> (String, String) {
        (component.id.clone(), component.kind.clone())
    }

    fn bindings_of<'s>(
        &'s self,
        context: &'s Option<Arc<NamingServant>>,
    ) -> std::sync::MutexGuard<'s, IndexMap<(String, String), Binding>> {
        match context {
            None => self.bindings.lock().unwrap(),
            Some(c) => c.bindings.lock().unwrap(),
        }
    }

    /// Walks to the context owning the final component (`None` = this one).
    /// Every intermediate component must resolve to a local subcontext.
    fn walk(
        &self,
        name: &[NameComponent],
    ) -> std::result::Result<(Option<Arc<NamingServant>>, NameComponent), NamingFault> {
        if name.is_empty() {
            return Err(NamingFault::InvalidName);
        }
        let mut current: Option<Arc<NamingServant>> = None;
        for (i, component) in name[..name.len() - 1].iter().enumerate() {
            let next = {
                let bindings = self.bindings_of(&current);
                match bindings.get(&Self::key(component)) {
                    Some(Binding::Context {
                        local: Some(local), ..
                    }) => local.clone(),
                    Some(Binding::Context { local: None, .. }) => {
                        return Err(NamingFault::CannotProceed {
                            rest: name[i..].to_vec(),
                        })
                    }
                    Some(Binding::Object(_)) => {
                        return Err(NamingFault::NotFound {
                            why: NOT_FOUND_NOT_CONTEXT,
                            rest: name[i..].to_vec(),
                        })
                    }
                    None => {
                        return Err(NamingFault::NotFound {
                            why: NOT_FOUND_MISSING_NODE,
                            rest: name[i..].to_vec(),
                        })
                    }
                }
            };
            current = Some(next);
        }
        Ok((current, name[name.len() - 1].clone()))
    }

    fn insert(
        &self,
        name: &[NameComponent],
        binding: Binding,
        replace: bool,
    ) -> std::result::Result<(), NamingFault> {
        let (context, last) = self.walk(name)?;
        let mut bindings = self.bindings_of(&context);
        if !replace && bindings.contains_key(&Self::key(&last)) {
            return Err(NamingFault::AlreadyBound);
        }
        bindings.insert(Self::key(&last), binding);
        Ok(())
    }

    fn resolve_ior(&self, name: &[NameComponent]) -> std::result::Result<Ior, NamingFault> {
        let (context, last) = self.walk(name)?;
        let bindings = self.bindings_of(&context);
        match bindings.get(&Self::key(&last)) {
            Some(Binding::Object(ior)) | Some(Binding::Context { ior, .. }) => Ok(ior.clone()),
            None => Err(NamingFault::NotFound {
                why: NOT_FOUND_MISSING_NODE,
                rest: vec![last],
            }),
        }
    }

    fn remove(&self, name: &[NameComponent]) -> std::result::Result<(), NamingFault> {
        let (context, last) = self.walk(name)?;
        let mut bindings = self.bindings_of(&context);
        match bindings.shift_remove(&Self::key(&last)) {
            Some(Binding::Context {
                local: Some(local), ..
            }) if !local.bindings.lock().unwrap().is_empty() => {
                // refuse to orphan a non-empty local subcontext
                bindings.insert(
                    Self::key(&last),
                    Binding::Context {
                        ior: Ior::nil(),
                        local: Some(local),
                    },
                );
                Err(NamingFault::NotEmpty)
            }
            Some(_) => Ok(()),
            None => Err(NamingFault::NotFound {
                why: NOT_FOUND_MISSING_NODE,
                rest: vec![last],
            }),
        }
    }

    fn new_subcontext(&self) -> Result<(Arc<NamingServant>, Ior)> {
        let poa = self.poa()?;
        let child = NamingServant::new();
        *child.poa.lock().unwrap() = Arc::downgrade(&poa);
        let oid = poa.activate_object(child.clone())?;
        let ior = poa.create_reference_with_id(&oid, NAMING_CONTEXT_ID)?;
        Ok((child, ior))
    }
}

#[async_trait]
impl Servant for NamingServant {
    fn repository_id(&self) -> &str {
        NAMING_CONTEXT_ID
    }

    async fn invoke(
        &self,
        operation: &str,
        input: &mut CdrReader<'_>,
        output: &mut CdrWriter,
    ) -> Result<()> {
        let order = output.order();
        let minor = output.giop_minor();
        let fault = |f: NamingFault| f.into_user_exception(order, minor);
        trace!("naming operation '{operation}'");
        match operation {
            "bind" => {
                let name = decode_name(input)?;
                let ior = Ior::decode(input)?;
                self.insert(&name, Binding::Object(ior), false)
                    .map_err(fault)?;
                debug!("bound {}", format_name(&name));
            }
            "rebind" => {
                let name = decode_name(input)?;
                let ior = Ior::decode(input)?;
                self.insert(&name, Binding::Object(ior), true)
                    .map_err(fault)?;
            }
            "bind_context" => {
                let name = decode_name(input)?;
                let ior = Ior::decode(input)?;
                self.insert(&name, Binding::Context { ior, local: None }, false)
                    .map_err(fault)?;
            }
            "bind_new_context" => {
                let name = decode_name(input)?;
                let (child, ior) = self.new_subcontext()?;
                self.insert(
                    &name,
                    Binding::Context {
                        ior: ior.clone(),
                        local: Some(child),
                    },
                    false,
                )
                .map_err(fault)?;
                ior.encode(output);
            }
            "new_context" => {
                let (_, ior) = self.new_subcontext()?;
                ior.encode(output);
            }
            "resolve" => {
                let name = decode_name(input)?;
                let ior = self.resolve_ior(&name).map_err(fault)?;
                ior.encode(output);
            }
            "unbind" => {
                let name = decode_name(input)?;
                self.remove(&name).map_err(fault)?;
            }
            other => {
                return Err(SystemException::bad_operation(0, CompletionStatus::No)
                    .into_error(format!("NamingContext has no operation '{other}'")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringified_names_round_trip() {
        let name = vec![
            NameComponent::new("Applications", ""),
            NameComponent::new("Echo", "Service"),
        ];
        let s = format_name(&name);
        assert_eq!(s, "Applications/Echo.Service");
        assert_eq!(parse_name(&s).unwrap(), name);
    }

    #[test]
    fn escapes_survive() {
        let name = vec![NameComponent::new("a.b/c\\d", "k.k")];
        let parsed = parse_name(&format_name(&name)).unwrap();
        assert_eq!(parsed, name);
    }

    #[test]
    fn empty_and_malformed_names_are_invalid() {
        assert!(parse_name("").is_err());
        assert!(parse_name("a//b").is_err());
        assert!(parse_name("a.b.c").is_err());
        assert!(parse_name("trailing\\").is_err());
    }

    #[test]
    fn name_wire_round_trip() {
        let name = vec![
            NameComponent::new("Applications", ""),
            NameComponent::new("Echo", "Service"),
        ];
        let mut w = CdrWriter::new(ByteOrder::Little);
        encode_name(&name, &mut w);
        let bytes = w.into_bytes();
        let mut r = CdrReader::new(&bytes, ByteOrder::Little);
        assert_eq!(decode_name(&mut r).unwrap(), name);
    }
}
