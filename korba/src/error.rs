use thiserror::Error;

/// Completion status carried by every system exception, telling the caller
/// how far the invocation got before it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    Yes,
    No,
    Maybe,
}

impl CompletionStatus {
    pub fn to_wire(self) -> u32 {
        match self {
            CompletionStatus::Yes => 0,
            CompletionStatus::No => 1,
            CompletionStatus::Maybe => 2,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self> {
        Ok(match value {
            0 => CompletionStatus::Yes,
            1 => CompletionStatus::No,
            2 => CompletionStatus::Maybe,
            x => {
                return Err(SystemException::marshal_error(MINOR_BAD_COMPLETION, CompletionStatus::Maybe)
                    .into_error(format!("invalid completion status: {x}")))
            }
        })
    }
}

pub const MINOR_BAD_COMPLETION: u32 = 1;

macro_rules! system_exceptions {
    ($($variant:ident => $name:literal, $ctor:ident;)*) => {
        /// The standard CORBA system exception kinds.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum SystemExceptionKind {
            $($variant,)*
        }

        impl SystemExceptionKind {
            pub fn name(self) -> &'static str {
                match self {
                    $(SystemExceptionKind::$variant => $name,)*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(SystemExceptionKind::$variant),)*
                    _ => None,
                }
            }
        }

        impl SystemException {
            $(
                pub fn $ctor(minor: u32, completed: CompletionStatus) -> Self {
                    SystemException::new(SystemExceptionKind::$variant, minor, completed)
                }
            )*
        }
    };
}

system_exceptions! {
    Unknown => "UNKNOWN", unknown;
    BadParam => "BAD_PARAM", bad_param;
    NoMemory => "NO_MEMORY", no_memory;
    ImpLimit => "IMP_LIMIT", imp_limit;
    CommFailure => "COMM_FAILURE", comm_failure;
    InvObjref => "INV_OBJREF", inv_objref;
    NoPermission => "NO_PERMISSION", no_permission;
    Internal => "INTERNAL", internal;
    Marshal => "MARSHAL", marshal_error;
    Initialize => "INITIALIZE", initialize;
    NoImplement => "NO_IMPLEMENT", no_implement;
    BadTypecode => "BAD_TYPECODE", bad_typecode;
    BadOperation => "BAD_OPERATION", bad_operation;
    NoResources => "NO_RESOURCES", no_resources;
    NoResponse => "NO_RESPONSE", no_response;
    PersistStore => "PERSIST_STORE", persist_store;
    BadInvOrder => "BAD_INV_ORDER", bad_inv_order;
    Transient => "TRANSIENT", transient;
    FreeMem => "FREE_MEM", free_mem;
    InvIdent => "INV_IDENT", inv_ident;
    InvFlag => "INV_FLAG", inv_flag;
    IntfRepos => "INTF_REPOS", intf_repos;
    BadContext => "BAD_CONTEXT", bad_context;
    ObjAdapter => "OBJ_ADAPTER", obj_adapter;
    DataConversion => "DATA_CONVERSION", data_conversion;
    ObjectNotExist => "OBJECT_NOT_EXIST", object_not_exist;
    TransactionRequired => "TRANSACTION_REQUIRED", transaction_required;
    TransactionRolledback => "TRANSACTION_ROLLEDBACK", transaction_rolledback;
    InvalidTransaction => "INVALID_TRANSACTION", invalid_transaction;
    InvPolicy => "INV_POLICY", inv_policy;
    CodesetIncompatible => "CODESET_INCOMPATIBLE", codeset_incompatible;
    Rebind => "REBIND", rebind;
    Timeout => "TIMEOUT", timeout;
    TransactionUnavailable => "TRANSACTION_UNAVAILABLE", transaction_unavailable;
    TransactionMode => "TRANSACTION_MODE", transaction_mode;
}

/// A CORBA system exception: one of the 35 standard kinds plus a minor code
/// and a completion status. These travel in `SYSTEM_EXCEPTION` reply bodies
/// and are the error currency of the whole request plane.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{}: minor={} completed={:?}{}", self.kind.name(), self.minor, self.completed, self.detail_suffix())]
pub struct SystemException {
    pub kind: SystemExceptionKind,
    pub minor: u32,
    pub completed: CompletionStatus,
    /// Local diagnostic only, never marshaled.
    pub detail: Option<String>,
}

impl SystemException {
    pub fn new(kind: SystemExceptionKind, minor: u32, completed: CompletionStatus) -> Self {
        SystemException {
            kind,
            minor,
            completed,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn into_error(self, detail: impl Into<String>) -> OrbError {
        OrbError::System(self.with_detail(detail))
    }

    /// `IDL:omg.org/CORBA/<NAME>:1.0`
    pub fn repository_id(&self) -> String {
        format!("IDL:omg.org/CORBA/{}:1.0", self.kind.name())
    }

    /// Recovers the kind from a marshaled repository id, falling back to
    /// `UNKNOWN` for ids outside the standard set.
    pub fn kind_from_repository_id(id: &str) -> SystemExceptionKind {
        id.strip_prefix("IDL:omg.org/CORBA/")
            .and_then(|rest| rest.strip_suffix(":1.0"))
            .and_then(SystemExceptionKind::from_name)
            .unwrap_or(SystemExceptionKind::Unknown)
    }

    fn detail_suffix(&self) -> String {
        match &self.detail {
            Some(d) => format!(" ({d})"),
            None => String::new(),
        }
    }
}

/// An application-declared exception. The members stay CDR-encoded; typed
/// layers decode them against their own TypeCodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserException {
    pub repository_id: String,
    pub body: Vec<u8>,
}

impl UserException {
    pub fn new(repository_id: impl Into<String>, body: Vec<u8>) -> Self {
        UserException {
            repository_id: repository_id.into(),
            body,
        }
    }
}

#[derive(Clone, Debug, Error)]
pub enum OrbError {
    #[error("{0}")]
    System(#[from] SystemException),
    #[error("user exception {}", .0.repository_id)]
    User(UserException),
}

impl OrbError {
    /// Whether this is a system exception of the given kind.
    pub fn is_system(&self, kind: SystemExceptionKind) -> bool {
        matches!(self, OrbError::System(e) if e.kind == kind)
    }

    pub fn system(&self) -> Option<&SystemException> {
        match self {
            OrbError::System(e) => Some(e),
            OrbError::User(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrbError>;

/// Shorthand for the ubiquitous `MARSHAL` stream failures.
pub fn marshal(detail: impl Into<String>) -> OrbError {
    SystemException::marshal_error(0, CompletionStatus::Maybe).into_error(detail)
}

/// Maps a transport error onto `COMM_FAILURE` with the completion status the
/// caller observed.
pub fn comm_failure_io(err: &std::io::Error, completed: CompletionStatus) -> OrbError {
    SystemException::comm_failure(0, completed).into_error(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_id_round_trip() {
        let e = SystemException::object_not_exist(2, CompletionStatus::No);
        assert_eq!(e.repository_id(), "IDL:omg.org/CORBA/OBJECT_NOT_EXIST:1.0");
        assert_eq!(
            SystemException::kind_from_repository_id(&e.repository_id()),
            SystemExceptionKind::ObjectNotExist
        );
    }

    #[test]
    fn unknown_repository_id_degrades() {
        assert_eq!(
            SystemException::kind_from_repository_id("IDL:acme.org/Weird:1.0"),
            SystemExceptionKind::Unknown
        );
    }

    #[test]
    fn completion_status_wire() {
        for status in [
            CompletionStatus::Yes,
            CompletionStatus::No,
            CompletionStatus::Maybe,
        ] {
            assert_eq!(CompletionStatus::from_wire(status.to_wire()).unwrap(), status);
        }
        assert!(CompletionStatus::from_wire(3).is_err());
    }

    #[test]
    fn user_exceptions_stay_user() {
        let err = OrbError::User(UserException::new("IDL:Test/Oops:1.0", vec![]));
        assert!(err.system().is_none());
    }
}
