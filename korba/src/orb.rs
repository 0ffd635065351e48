use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::acceptor::Acceptor;
use crate::cdr::{ByteOrder, CdrReader, CdrWriter};
use crate::codec::{decode_value, encode_value};
use crate::connection::PendingGauge;
use crate::error::{CompletionStatus, OrbError, Result, SystemException, SystemExceptionKind};
use crate::giop::{self, ReplyStatus, TargetAddress};
use crate::ior::{self, Ior};
use crate::object::ObjectRef;
use crate::poa::{Poa, PoaDispatcher, PoaManager, PoaManagerState, PoaPolicies};
use crate::pool::Pool;
use crate::typecode::TypeCode;
use crate::value::Value;

/// Options for an ORB instance.
#[derive(Debug, Clone)]
pub struct OrbOptions {
    /// Bind/advertise host for the server endpoint.
    pub host: String,
    /// Server port; 0 picks an ephemeral port.
    pub port: u16,
    /// GIOP minor version emitted on outbound requests (0, 1 or 2).
    pub giop_minor: u8,
    /// Byte order of emitted messages.
    pub byte_order: ByteOrder,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Idle connections past this are closed.
    pub idle_timeout: Duration,
    /// Per-connection cap on in-flight requests.
    pub max_pending: usize,
    /// Emit CancelRequest when a pending request times out.
    pub send_cancel_request: bool,
    /// Hard cap on `shutdown(wait = true)` draining.
    pub shutdown_grace: Duration,
}

impl Default for OrbOptions {
    fn default() -> Self {
        OrbOptions {
            host: "127.0.0.1".to_string(),
            port: 0,
            giop_minor: crate::DEFAULT_GIOP_MINOR,
            byte_order: ByteOrder::Big,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(300),
            max_pending: 256,
            send_cancel_request: true,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// An undecoded reply body plus the stream parameters needed to decode it.
#[derive(Debug)]
pub struct ReplyBody {
    pub bytes: Vec<u8>,
    pub order: ByteOrder,
    pub minor: u8,
}

impl ReplyBody {
    pub fn reader(&self) -> CdrReader<'_> {
        CdrReader::with_giop_minor(&self.bytes, self.order, self.minor)
    }
}

const MAX_FORWARDS: usize = 4;

struct OrbCore {
    options: Arc<OrbOptions>,
    gauge: Arc<PendingGauge>,
    pool: Pool,
    root_poa: Arc<Poa>,
    acceptor: Acceptor,
    initial_refs: Mutex<IndexMap<String, ObjectRef>>,
    shutdown: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

/// The process-scoped broker: owns the outbound pool, the root POA with its
/// acceptor, and the initial-references registry. Cheap to clone.
#[derive(Clone)]
pub struct Orb {
    inner: Arc<OrbCore>,
}

impl std::fmt::Debug for Orb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orb").finish_non_exhaustive()
    }
}

impl Orb {
    /// Brings up an ORB: binds the server endpoint, creates the root POA
    /// (manager initially `HOLDING`) and starts serving inbound requests.
    pub async fn init(options: OrbOptions) -> Result<Orb> {
        let options = Arc::new(options);
        let gauge = Arc::new(PendingGauge::default());
        let acceptor = Acceptor::bind(&options.host, options.port).await?;
        let port = acceptor.local_addr().port();
        let manager = PoaManager::new();
        let root_poa = Poa::new_root(
            (options.host.clone(), port),
            manager.clone(),
            PoaPolicies::default(),
        );
        let dispatcher = PoaDispatcher::new(root_poa.clone());
        acceptor.start(options.clone(), gauge.clone(), dispatcher);

        let orb = Orb {
            inner: Arc::new(OrbCore {
                pool: Pool::new(options.clone(), gauge.clone()),
                options,
                gauge,
                root_poa,
                acceptor,
                initial_refs: Mutex::new(IndexMap::new()),
                shutdown: watch::channel(false).0,
                shutting_down: AtomicBool::new(false),
            }),
        };

        // the acceptor follows the root manager down
        let weak = Arc::downgrade(&orb.inner);
        let mut manager_rx = manager.subscribe();
        tokio::spawn(async move {
            loop {
                if *manager_rx.borrow_and_update() == PoaManagerState::Inactive {
                    if let Some(core) = weak.upgrade() {
                        core.acceptor.stop().await;
                    }
                    return;
                }
                if manager_rx.changed().await.is_err() {
                    return;
                }
            }
        });

        info!(
            "ORB listening on {}:{}",
            orb.inner.options.host,
            orb.inner.acceptor.local_addr().port()
        );
        Ok(orb)
    }

    pub fn options(&self) -> &OrbOptions {
        &self.inner.options
    }

    pub fn root_poa(&self) -> &Arc<Poa> {
        &self.inner.root_poa
    }

    /// The bound server endpoint.
    pub fn endpoint(&self) -> (String, u16) {
        (
            self.inner.options.host.clone(),
            self.inner.acceptor.local_addr().port(),
        )
    }

    pub fn object_from_ior(&self, ior: Ior) -> ObjectRef {
        ObjectRef::new(self.clone(), ior)
    }

    /// Parses `IOR:`, `corbaloc:` or `corbaname:` forms into a proxy.
    /// `corbaname:` resolution invokes the named naming context.
    pub async fn string_to_object(&self, s: &str) -> Result<ObjectRef> {
        self.check_not_shutdown()?;
        if s.starts_with("IOR:") {
            Ok(self.object_from_ior(Ior::parse(s)?))
        } else if s.starts_with("corbaloc:") {
            Ok(self.object_from_ior(ior::parse_corbaloc(s)?))
        } else if s.starts_with("corbaname:") {
            let (naming_ior, name) = ior::parse_corbaname(s)?;
            let context = crate::naming::NamingContext::from_object(self.object_from_ior(naming_ior));
            context.resolve_str(&name).await
        } else {
            Err(SystemException::inv_objref(0, CompletionStatus::No)
                .into_error(format!("unrecognized object URL '{s}'")))
        }
    }

    /// `BAD_PARAM` for a nil reference.
    pub fn object_to_string(&self, object: &ObjectRef) -> Result<String> {
        if object.is_nil() {
            return Err(SystemException::bad_param(0, CompletionStatus::No)
                .into_error("cannot stringify a nil reference"));
        }
        Ok(object.ior().stringify())
    }

    pub fn register_initial_reference(&self, id: &str, object: ObjectRef) -> Result<()> {
        let mut refs = self.inner.initial_refs.lock().unwrap();
        if refs.contains_key(id) {
            return Err(SystemException::bad_param(0, CompletionStatus::No)
                .into_error(format!("initial reference '{id}' already registered")));
        }
        refs.insert(id.to_string(), object);
        Ok(())
    }

    pub fn resolve_initial_references(&self, id: &str) -> Result<ObjectRef> {
        self.inner
            .initial_refs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| {
                SystemException::inv_objref(0, CompletionStatus::No)
                    .into_error(format!("no initial reference '{id}'"))
            })
    }

    /// Dynamic invocation with inferred TypeCodes: every argument must be in
    /// the documented inference table, the return decodes per `return_tc`
    /// (`None` means void).
    pub async fn invoke(
        &self,
        target: &ObjectRef,
        operation: &str,
        args: &[Value],
        return_tc: Option<&TypeCode>,
    ) -> Result<Value> {
        let mut w = CdrWriter::with_giop_minor(
            self.inner.options.byte_order,
            self.inner.options.giop_minor,
        );
        for arg in args {
            let tc = arg.guess_typecode().ok_or_else(|| {
                SystemException::bad_param(0, CompletionStatus::No).into_error(format!(
                    "cannot infer a TypeCode for {arg:?}; build a DII request with explicit TypeCodes"
                ))
            })?;
            encode_value(&tc, arg, &mut w)?;
        }
        let reply = self
            .invoke_with_encoded(target, operation, w.into_bytes())
            .await?;
        match return_tc {
            Some(tc) => decode_value(tc, &mut reply.reader()),
            None => Ok(Value::Void),
        }
    }

    /// Sends a pre-encoded argument body and returns the raw reply body.
    /// Location forwards are followed (bounded); system exceptions in the
    /// reply surface as errors; user exceptions arrive as `OrbError::User`.
    pub async fn invoke_with_encoded(
        &self,
        target: &ObjectRef,
        operation: &str,
        body: Vec<u8>,
    ) -> Result<ReplyBody> {
        self.check_not_shutdown()?;
        let mut ior = target.ior().clone();
        let mut addressing: u16 = 0;
        for _ in 0..=MAX_FORWARDS {
            let profile = ior.iiop_profile()?;
            let conn = self
                .inner
                .pool
                .checkout(&profile.host, profile.port)
                .await?;
            let target_address = match addressing {
                1 => match ior.profiles.iter().find(|p| p.id == ior::TAG_INTERNET_IOP) {
                    Some(profile) => TargetAddress::Profile(profile.clone()),
                    None => TargetAddress::Key(profile.object_key.clone()),
                },
                2 => TargetAddress::Reference {
                    profile_index: 0,
                    ior: ior.clone(),
                },
                _ => TargetAddress::Key(profile.object_key.clone()),
            };
            let envelope = match conn
                .invoke(target_address, operation, body.clone())
                .await
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    if e.is_system(SystemExceptionKind::CommFailure) {
                        self.inner.pool.evict(&profile.host, profile.port);
                    }
                    return Err(e);
                }
            };
            let mut r = CdrReader::with_giop_minor(&envelope.body, envelope.order, envelope.minor);
            match envelope.header.status {
                ReplyStatus::NoException => {
                    return Ok(ReplyBody {
                        bytes: envelope.body,
                        order: envelope.order,
                        minor: envelope.minor,
                    })
                }
                ReplyStatus::SystemException => {
                    let exception = giop::decode_system_exception(&mut r)?;
                    if exception.kind == SystemExceptionKind::CommFailure {
                        self.inner.pool.evict(&profile.host, profile.port);
                    }
                    return Err(OrbError::System(exception));
                }
                ReplyStatus::UserException => {
                    return Err(OrbError::User(giop::decode_user_exception(&mut r)?));
                }
                ReplyStatus::LocationForward | ReplyStatus::LocationForwardPerm => {
                    ior = Ior::decode(&mut r)?;
                    debug!("'{operation}' forwarded to {}", ior.stringify());
                }
                ReplyStatus::NeedsAddressingMode => {
                    addressing = r.read_u16()?;
                    if addressing > 2 {
                        return Err(SystemException::inv_objref(0, CompletionStatus::No)
                            .into_error(format!("peer requested addressing mode {addressing}")));
                    }
                }
            }
        }
        Err(SystemException::transient(0, CompletionStatus::No)
            .into_error(format!("'{operation}' forwarded more than {MAX_FORWARDS} times")))
    }

    /// Fire-and-forget request; resolves when the bytes are flushed.
    pub async fn send_oneway(
        &self,
        target: &ObjectRef,
        operation: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        self.check_not_shutdown()?;
        let profile = target.ior().iiop_profile()?;
        let conn = self
            .inner
            .pool
            .checkout(&profile.host, profile.port)
            .await?;
        conn.send_oneway(
            TargetAddress::Key(profile.object_key.clone()),
            operation,
            body,
        )
        .await
    }

    /// Probes where an object lives via LocateRequest.
    pub async fn locate(&self, target: &ObjectRef) -> Result<giop::LocateStatus> {
        self.check_not_shutdown()?;
        let profile = target.ior().iiop_profile()?;
        let conn = self
            .inner
            .pool
            .checkout(&profile.host, profile.port)
            .await?;
        conn.locate(TargetAddress::Key(profile.object_key.clone()))
            .await
    }

    /// Parks the caller until `shutdown`.
    pub async fn run(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Drains and stops the ORB. New invocations fail with `BAD_INV_ORDER`
    /// immediately; with `wait`, pending outbound requests get up to the
    /// grace period to complete before being cut off.
    pub async fn shutdown(&self, wait: bool) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("ORB shutting down (wait = {wait})");
        let _ = self.inner.root_poa.manager().deactivate();
        self.inner.acceptor.stop().await;
        if wait && timeout(self.inner.options.shutdown_grace, self.inner.gauge.wait_idle())
            .await
            .is_err()
        {
            warn!(
                "{} requests still pending after shutdown grace, cancelling",
                self.inner.gauge.count()
            );
        }
        self.inner.pool.close_all().await;
        self.inner.shutdown.send_replace(true);
    }

    fn check_not_shutdown(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SystemException::bad_inv_order(0, CompletionStatus::No)
                .into_error("ORB is shut down"));
        }
        Ok(())
    }
}
