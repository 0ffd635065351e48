pub const GIOP_VERSION_MAJOR: u8 = 1;
pub const DEFAULT_GIOP_MINOR: u8 = 2;

mod acceptor;
mod cdr;
mod codec;
mod connection;
mod dii;
pub mod error;
mod giop;
mod ior;
mod naming;
mod object;
mod orb;
mod poa;
mod pool;
mod typecode;
mod value;

pub use cdr::{ByteOrder, CdrReader, CdrWriter};
pub use codec::{decode_value, encode_value};
pub use connection::{Connection, InboundHandler, ReplyEnvelope};
pub use dii::{ParamMode, Parameter, Request};
pub use error::{
    CompletionStatus, OrbError, Result, SystemException, SystemExceptionKind, UserException,
};
pub use giop::{
    LocateStatus, MessageKind, ReplyStatus, RequestHeader, ServiceContext, TargetAddress,
};
pub use ior::{
    parse_corbaloc, parse_corbaname, IiopProfile, Ior, ObjectKey, TaggedComponent, TaggedProfile,
};
pub use naming::{
    format_name, parse_name, Name, NameComponent, NamingContext, NamingServant,
    NAMING_CONTEXT_ID,
};
pub use object::ObjectRef;
pub use orb::{Orb, OrbOptions, ReplyBody};
pub use poa::{
    AdapterActivator, IdAssignment, Lifespan, Poa, PoaManager, PoaManagerState, PoaPolicies,
    RequestProcessing, Servant, ServantActivator,
};
pub use typecode::{Member, TypeCode, UnionMember};
pub use value::Value;
