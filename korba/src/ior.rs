use crate::cdr::{ByteOrder, CdrReader, CdrWriter};
use crate::error::{CompletionStatus, Result, SystemException};

pub const TAG_INTERNET_IOP: u32 = 0;
pub const TAG_MULTIPLE_COMPONENTS: u32 = 1;
pub const TAG_CODE_SETS: u32 = 1;

pub const DEFAULT_CORBALOC_PORT: u16 = 2809;

/// Opaque bytes identifying a servant within its POA.
pub type ObjectKey = Vec<u8>;

fn inv_objref(detail: impl Into<String>) -> crate::error::OrbError {
    SystemException::inv_objref(0, CompletionStatus::No).into_error(detail)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaggedComponent {
    pub id: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaggedProfile {
    pub id: u32,
    pub data: Vec<u8>,
}

/// The decoded body of a `TAG_INTERNET_IOP` profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IiopProfile {
    pub major: u8,
    pub minor: u8,
    pub host: String,
    pub port: u16,
    pub object_key: ObjectKey,
    pub components: Vec<TaggedComponent>,
}

impl IiopProfile {
    pub fn new(host: impl Into<String>, port: u16, object_key: ObjectKey) -> Self {
        IiopProfile {
            major: 1,
            minor: crate::DEFAULT_GIOP_MINOR,
            host: host.into(),
            port,
            object_key,
            components: Vec::new(),
        }
    }

    pub fn to_tagged(&self) -> TaggedProfile {
        let mut w = CdrWriter::new(ByteOrder::Big);
        w.write_octet(w.order().flag());
        w.write_octet(self.major);
        w.write_octet(self.minor);
        w.write_string(&self.host);
        w.write_u16(self.port);
        w.write_octet_seq(&self.object_key);
        if self.minor >= 1 {
            w.write_u32(self.components.len() as u32);
            for component in &self.components {
                w.write_u32(component.id);
                w.write_octet_seq(&component.data);
            }
        }
        TaggedProfile {
            id: TAG_INTERNET_IOP,
            data: w.into_bytes(),
        }
    }

    pub fn from_tagged(profile: &TaggedProfile) -> Result<IiopProfile> {
        if profile.id != TAG_INTERNET_IOP {
            return Err(inv_objref(format!("profile tag {} is not IIOP", profile.id)));
        }
        let mut r = CdrReader::for_encapsulation(&profile.data)?;
        let major = r.read_octet()?;
        let minor = r.read_octet()?;
        if major != 1 {
            return Err(inv_objref(format!("unsupported IIOP version {major}.{minor}")));
        }
        let host = r.read_string()?;
        let port = r.read_u16()?;
        let object_key = r.read_octet_seq()?;
        let mut components = Vec::new();
        if minor >= 1 && r.remaining() > 0 {
            let count = r.read_sequence_len()?;
            for _ in 0..count {
                let id = r.read_u32()?;
                let data = r.read_octet_seq()?;
                components.push(TaggedComponent { id, data });
            }
        }
        Ok(IiopProfile {
            major,
            minor,
            host,
            port,
            object_key,
            components,
        })
    }
}

/// An Interoperable Object Reference: a repository type id plus any number
/// of tagged profiles. Zero profiles is the nil reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ior {
    pub type_id: String,
    pub profiles: Vec<TaggedProfile>,
}

impl Ior {
    pub fn nil() -> Ior {
        Ior {
            type_id: String::new(),
            profiles: Vec::new(),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Builds a reference with a single IIOP profile.
    pub fn new_iiop(
        type_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        object_key: ObjectKey,
    ) -> Ior {
        Ior {
            type_id: type_id.into(),
            profiles: vec![IiopProfile::new(host, port, object_key).to_tagged()],
        }
    }

    /// First IIOP profile, decoded.
    pub fn iiop_profile(&self) -> Result<IiopProfile> {
        self.profiles
            .iter()
            .find(|p| p.id == TAG_INTERNET_IOP)
            .map(IiopProfile::from_tagged)
            .unwrap_or_else(|| Err(inv_objref("reference has no IIOP profile")))
    }

    pub fn encode(&self, w: &mut CdrWriter) {
        w.write_string(&self.type_id);
        w.write_u32(self.profiles.len() as u32);
        for profile in &self.profiles {
            w.write_u32(profile.id);
            w.write_octet_seq(&profile.data);
        }
    }

    pub fn decode(r: &mut CdrReader<'_>) -> Result<Ior> {
        let type_id = r.read_string()?;
        let count = r.read_sequence_len()?;
        let mut profiles = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let id = r.read_u32()?;
            let data = r.read_octet_seq()?;
            profiles.push(TaggedProfile { id, data });
        }
        Ok(Ior { type_id, profiles })
    }

    /// The encapsulation form hashed and hex-dumped by `stringify`: endian
    /// flag octet followed by the CDR of the structure.
    pub fn to_encapsulation_bytes(&self) -> Vec<u8> {
        let mut w = CdrWriter::new(ByteOrder::Big);
        w.write_octet(w.order().flag());
        self.encode(&mut w);
        w.into_bytes()
    }

    pub fn from_encapsulation_bytes(bytes: &[u8]) -> Result<Ior> {
        let mut r = CdrReader::for_encapsulation(bytes)?;
        Ior::decode(&mut r)
    }

    pub fn stringify(&self) -> String {
        format!("IOR:{}", hex::encode(self.to_encapsulation_bytes()))
    }

    pub fn parse(s: &str) -> Result<Ior> {
        let Some(hex_part) = s.strip_prefix("IOR:") else {
            return Err(inv_objref("stringified reference must start with IOR:"));
        };
        let bytes = hex::decode(hex_part)
            .map_err(|e| inv_objref(format!("bad hex in stringified reference: {e}")))?;
        Ior::from_encapsulation_bytes(&bytes)
    }

    /// Canonical form for equivalence checks: profiles ordered by (tag,
    /// data), IIOP components ordered by (tag, data).
    pub fn canonical(&self) -> Ior {
        let mut profiles: Vec<TaggedProfile> = self
            .profiles
            .iter()
            .map(|profile| {
                if let Ok(mut iiop) = IiopProfile::from_tagged(profile) {
                    iiop.components.sort_by(|a, b| (a.id, &a.data).cmp(&(b.id, &b.data)));
                    iiop.to_tagged()
                } else {
                    profile.clone()
                }
            })
            .collect();
        profiles.sort_by(|a, b| (a.id, &a.data).cmp(&(b.id, &b.data)));
        Ior {
            type_id: self.type_id.clone(),
            profiles,
        }
    }

    pub fn is_equivalent(&self, other: &Ior) -> bool {
        self.canonical().stringify() == other.canonical().stringify()
    }
}

/// Parses `corbaloc:iiop:host:port/key` (comma-separated multi-target form
/// included) into a reference with one IIOP profile per target.
pub fn parse_corbaloc(s: &str) -> Result<Ior> {
    let Some(rest) = s.strip_prefix("corbaloc:") else {
        return Err(inv_objref("not a corbaloc URL"));
    };
    let (addr_list, key) = match rest.find('/') {
        Some(slash) => (&rest[..slash], percent_decode(&rest[slash + 1..])?),
        None => (rest, Vec::new()),
    };
    let mut profiles = Vec::new();
    for addr in addr_list.split(',') {
        let addr = addr
            .strip_prefix("iiop:")
            .or_else(|| addr.strip_prefix(":"))
            .ok_or_else(|| inv_objref(format!("unsupported corbaloc protocol in '{addr}'")))?;
        let (version, hostport) = match addr.find('@') {
            Some(at) => {
                let (major, minor) = addr[..at]
                    .split_once('.')
                    .ok_or_else(|| inv_objref("malformed corbaloc version"))?;
                let major: u8 = major
                    .parse()
                    .map_err(|_| inv_objref("malformed corbaloc version"))?;
                let minor: u8 = minor
                    .parse()
                    .map_err(|_| inv_objref("malformed corbaloc version"))?;
                ((major, minor), &addr[at + 1..])
            }
            None => ((1, crate::DEFAULT_GIOP_MINOR), addr),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| inv_objref(format!("bad corbaloc port '{port}'")))?,
            ),
            None => (hostport, DEFAULT_CORBALOC_PORT),
        };
        if host.is_empty() {
            return Err(inv_objref("empty corbaloc host"));
        }
        let mut profile = IiopProfile::new(host, port, key.clone());
        profile.major = version.0;
        profile.minor = version.1;
        profiles.push(profile.to_tagged());
    }
    if profiles.is_empty() {
        return Err(inv_objref("corbaloc URL names no targets"));
    }
    Ok(Ior {
        type_id: String::new(),
        profiles,
    })
}

/// Splits `corbaname:<addr>#<stringified_name>` into the naming context
/// reference and the name to resolve against it.
pub fn parse_corbaname(s: &str) -> Result<(Ior, String)> {
    let Some(rest) = s.strip_prefix("corbaname:") else {
        return Err(inv_objref("not a corbaname URL"));
    };
    let (addr, name) = match rest.find('#') {
        Some(hash) => (&rest[..hash], rest[hash + 1..].to_string()),
        None => (rest, String::new()),
    };
    // default object key for the naming service endpoint
    let addr = if addr.contains('/') {
        addr.to_string()
    } else {
        format!("{addr}/NameService")
    };
    let ior = parse_corbaloc(&format!("corbaloc:{addr}"))?;
    Ok((ior, name))
}

fn percent_decode(s: &str) -> Result<Vec<u8>> {
    let raw = s.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let pair = s
                .get(i + 1..i + 3)
                .ok_or_else(|| inv_objref("truncated %-escape in object key"))?;
            let byte = hex::decode(pair)
                .map_err(|_| inv_objref(format!("bad %-escape '%{pair}' in object key")))?;
            out.push(byte[0]);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ior() -> Ior {
        Ior::new_iiop(
            "IDL:Test/Echo:1.0",
            "127.0.0.1",
            4097,
            vec![0xDE, 0xAD, 0xBE, 0xEF],
        )
    }

    #[test]
    fn stringify_parse_round_trip() {
        let ior = sample_ior();
        let s = ior.stringify();
        assert!(s.starts_with("IOR:"));
        assert_eq!(s, s.to_lowercase());
        assert_eq!(Ior::parse(&s).unwrap(), ior);
    }

    #[test]
    fn iiop_profile_round_trip() {
        let mut profile = IiopProfile::new("box.example.org", 2809, vec![1, 2, 3]);
        profile.components.push(TaggedComponent {
            id: TAG_CODE_SETS,
            data: vec![9, 9],
        });
        let decoded = IiopProfile::from_tagged(&profile.to_tagged()).unwrap();
        assert_eq!(decoded, profile);
    }

    #[test]
    fn giop_10_profile_has_no_components() {
        let mut profile = IiopProfile::new("h", 1, vec![7]);
        profile.minor = 0;
        let tagged = profile.to_tagged();
        let decoded = IiopProfile::from_tagged(&tagged).unwrap();
        assert_eq!(decoded.components, vec![]);
        assert_eq!(decoded.minor, 0);
    }

    #[test]
    fn nil_reference() {
        let nil = Ior::nil();
        assert!(nil.is_nil());
        assert_eq!(Ior::parse(&nil.stringify()).unwrap(), nil);
        assert!(nil.iiop_profile().is_err());
    }

    #[test]
    fn huge_and_empty_object_keys() {
        for key in [vec![], vec![0xAB; 10_000]] {
            let ior = Ior::new_iiop("", "h", 1, key.clone());
            let parsed = Ior::parse(&ior.stringify()).unwrap();
            assert_eq!(parsed.iiop_profile().unwrap().object_key, key);
        }
    }

    #[test]
    fn corbaloc_basic() {
        let ior = parse_corbaloc("corbaloc:iiop:127.0.0.1:4097/EchoService").unwrap();
        let profile = ior.iiop_profile().unwrap();
        assert_eq!(profile.host, "127.0.0.1");
        assert_eq!(profile.port, 4097);
        assert_eq!(profile.object_key, b"EchoService");
    }

    #[test]
    fn corbaloc_default_port_and_version() {
        let ior = parse_corbaloc("corbaloc:iiop:1.1@ns.example.org/Root").unwrap();
        let profile = ior.iiop_profile().unwrap();
        assert_eq!(profile.port, DEFAULT_CORBALOC_PORT);
        assert_eq!((profile.major, profile.minor), (1, 1));
    }

    #[test]
    fn corbaloc_multi_target() {
        let ior = parse_corbaloc("corbaloc:iiop:a:1,iiop:b:2/Key").unwrap();
        assert_eq!(ior.profiles.len(), 2);
        let hosts: Vec<String> = ior
            .profiles
            .iter()
            .map(|p| IiopProfile::from_tagged(p).unwrap().host)
            .collect();
        assert_eq!(hosts, vec!["a", "b"]);
    }

    #[test]
    fn corbaloc_escaped_key() {
        let ior = parse_corbaloc("corbaloc:iiop:h:1/a%20b%2Fc").unwrap();
        assert_eq!(ior.iiop_profile().unwrap().object_key, b"a b/c");
    }

    #[test]
    fn corbaname_split() {
        let (ior, name) =
            parse_corbaname("corbaname:iiop:ns.example.org:2809#Applications/Echo.Service")
                .unwrap();
        assert_eq!(ior.iiop_profile().unwrap().object_key, b"NameService");
        assert_eq!(name, "Applications/Echo.Service");
    }

    #[test]
    fn equivalence_ignores_profile_order() {
        let a = IiopProfile::new("a", 1, vec![1]).to_tagged();
        let b = IiopProfile::new("b", 2, vec![2]).to_tagged();
        let x = Ior {
            type_id: "IDL:T:1.0".to_string(),
            profiles: vec![a.clone(), b.clone()],
        };
        let y = Ior {
            type_id: "IDL:T:1.0".to_string(),
            profiles: vec![b, a],
        };
        assert!(x.is_equivalent(&y));
        assert!(!x.is_equivalent(&Ior::nil()));
    }
}
