use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, trace, warn};
use tokio::sync::watch;
use uuid::Uuid;

use crate::cdr::{ByteOrder, CdrReader, CdrWriter};
use crate::connection::{Connection, InboundHandler};
use crate::error::{CompletionStatus, OrbError, Result, SystemException};
use crate::giop::{
    self, LocateReplyHeader, LocateRequestHeader, LocateStatus, ReplyHeader, ReplyStatus,
    RequestHeader,
};
use crate::ior::{Ior, ObjectKey};

/// Gate for a set of POAs. `HOLDING` parks inbound dispatch, `DISCARDING`
/// rejects with `TRANSIENT`, `INACTIVE` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoaManagerState {
    Holding,
    Active,
    Discarding,
    Inactive,
}

pub struct PoaManager {
    state: watch::Sender<PoaManagerState>,
}

impl PoaManager {
    pub fn new() -> Arc<PoaManager> {
        Arc::new(PoaManager {
            state: watch::channel(PoaManagerState::Holding).0,
        })
    }

    pub fn state(&self) -> PoaManagerState {
        *self.state.borrow()
    }

    pub fn activate(&self) -> Result<()> {
        self.transition(PoaManagerState::Active)
    }

    pub fn hold_requests(&self) -> Result<()> {
        self.transition(PoaManagerState::Holding)
    }

    pub fn discard_requests(&self) -> Result<()> {
        self.transition(PoaManagerState::Discarding)
    }

    pub fn deactivate(&self) -> Result<()> {
        self.state.send_replace(PoaManagerState::Inactive);
        Ok(())
    }

    fn transition(&self, next: PoaManagerState) -> Result<()> {
        let mut rejected = false;
        self.state.send_modify(|state| {
            if *state == PoaManagerState::Inactive {
                rejected = true;
            } else {
                *state = next;
            }
        });
        if rejected {
            return Err(SystemException::bad_inv_order(0, CompletionStatus::No)
                .into_error("POAManager is inactive"));
        }
        Ok(())
    }

    /// Parks until the manager leaves `HOLDING`, then reports the state that
    /// released the request.
    pub(crate) async fn wait_while_holding(&self) -> PoaManagerState {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state != PoaManagerState::Holding {
                return state;
            }
            if rx.changed().await.is_err() {
                return PoaManagerState::Inactive;
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PoaManagerState> {
        self.state.subscribe()
    }
}

/// A concrete object implementation. `invoke` reads its arguments from the
/// request stream and writes results to the reply stream; system and user
/// exceptions propagate through the error.
#[async_trait]
pub trait Servant: Send + Sync {
    fn repository_id(&self) -> &str;

    async fn invoke(
        &self,
        operation: &str,
        input: &mut CdrReader<'_>,
        output: &mut CdrWriter,
    ) -> Result<()>;
}

/// Bare servant-manager surface: incarnates servants for keys missing from
/// the active map.
#[async_trait]
pub trait ServantActivator: Send + Sync {
    async fn incarnate(&self, oid: &[u8], poa: &Arc<Poa>) -> Result<Arc<dyn Servant>>;

    async fn etherealize(&self, _oid: &[u8], _poa: &Arc<Poa>, _servant: Arc<dyn Servant>) {}
}

/// Bare adapter-activator surface; not consulted by the dispatch path.
pub trait AdapterActivator: Send + Sync {
    fn unknown_adapter(&self, parent: &Arc<Poa>, name: &str) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdAssignment {
    System,
    User,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifespan {
    Transient,
    Persistent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestProcessing {
    ActiveObjectMapOnly,
    DefaultServant,
    ServantManager,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoaPolicies {
    pub id_assignment: IdAssignment,
    pub lifespan: Lifespan,
    pub request_processing: RequestProcessing,
}

impl Default for PoaPolicies {
    fn default() -> Self {
        PoaPolicies {
            id_assignment: IdAssignment::System,
            lifespan: Lifespan::Transient,
            request_processing: RequestProcessing::ActiveObjectMapOnly,
        }
    }
}

fn wrong_policy(detail: &str) -> OrbError {
    SystemException::inv_policy(0, CompletionStatus::No).into_error(detail)
}

fn adapter_destroyed() -> OrbError {
    SystemException::bad_inv_order(0, CompletionStatus::No).into_error("POA is destroyed")
}

/// A Portable Object Adapter: a named node in the adapter tree owning an
/// ObjectKey → Servant map and gated by its manager.
pub struct Poa {
    name: String,
    me: Weak<Poa>,
    parent: Weak<Poa>,
    manager: Arc<PoaManager>,
    policies: PoaPolicies,
    /// Advertised IIOP endpoint, shared down from the root.
    endpoint: (String, u16),
    children: Mutex<IndexMap<String, Arc<Poa>>>,
    servants: Mutex<IndexMap<ObjectKey, Arc<dyn Servant>>>,
    default_servant: Mutex<Option<Arc<dyn Servant>>>,
    servant_manager: Mutex<Option<Arc<dyn ServantActivator>>>,
    adapter_activator: Mutex<Option<Arc<dyn AdapterActivator>>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Poa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poa").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Poa {
    pub(crate) fn new_root(
        endpoint: (String, u16),
        manager: Arc<PoaManager>,
        policies: PoaPolicies,
    ) -> Arc<Poa> {
        Arc::new_cyclic(|me| Poa {
            name: "RootPOA".to_string(),
            me: me.clone(),
            parent: Weak::new(),
            manager,
            policies,
            endpoint,
            children: Mutex::new(IndexMap::new()),
            servants: Mutex::new(IndexMap::new()),
            default_servant: Mutex::new(None),
            servant_manager: Mutex::new(None),
            adapter_activator: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &Arc<PoaManager> {
        &self.manager
    }

    pub fn policies(&self) -> &PoaPolicies {
        &self.policies
    }

    pub fn endpoint(&self) -> &(String, u16) {
        &self.endpoint
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Creates a child adapter. Children share the parent's manager unless
    /// one is supplied; sibling names must be unique.
    pub fn create_child(
        &self,
        name: &str,
        manager: Option<Arc<PoaManager>>,
        policies: Option<PoaPolicies>,
    ) -> Result<Arc<Poa>> {
        if self.is_destroyed() {
            return Err(adapter_destroyed());
        }
        let mut children = self.children.lock().unwrap();
        if children.contains_key(name) {
            return Err(SystemException::bad_param(0, CompletionStatus::No)
                .into_error(format!("POA '{name}' already exists under '{}'", self.name)));
        }
        let child = Arc::new_cyclic(|me| Poa {
            name: name.to_string(),
            me: me.clone(),
            parent: self.me.clone(),
            manager: manager.unwrap_or_else(|| self.manager.clone()),
            policies: policies.unwrap_or_default(),
            endpoint: self.endpoint.clone(),
            children: Mutex::new(IndexMap::new()),
            servants: Mutex::new(IndexMap::new()),
            default_servant: Mutex::new(None),
            servant_manager: Mutex::new(None),
            adapter_activator: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        children.insert(name.to_string(), child.clone());
        debug!("created POA '{}' under '{}'", name, self.name);
        Ok(child)
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<Poa>> {
        self.children.lock().unwrap().get(name).cloned()
    }

    /// Activates a servant under a fresh 16-octet generated key.
    pub fn activate_object(&self, servant: Arc<dyn Servant>) -> Result<ObjectKey> {
        if self.policies.id_assignment != IdAssignment::System {
            return Err(wrong_policy("POA does not assign object ids"));
        }
        if self.is_destroyed() {
            return Err(adapter_destroyed());
        }
        let oid = Uuid::new_v4().into_bytes().to_vec();
        self.servants.lock().unwrap().insert(oid.clone(), servant);
        trace!("activated object {} in '{}'", hex::encode(&oid), self.name);
        Ok(oid)
    }

    /// Activates a servant under a caller-supplied key; an already-active
    /// key is `BAD_PARAM`.
    pub fn activate_object_with_id(&self, oid: &[u8], servant: Arc<dyn Servant>) -> Result<()> {
        if self.is_destroyed() {
            return Err(adapter_destroyed());
        }
        let mut servants = self.servants.lock().unwrap();
        if servants.contains_key(oid) {
            return Err(SystemException::bad_param(0, CompletionStatus::No)
                .into_error(format!("object id {} is already active", hex::encode(oid))));
        }
        servants.insert(oid.to_vec(), servant);
        Ok(())
    }

    pub fn deactivate_object(&self, oid: &[u8]) -> Result<()> {
        match self.servants.lock().unwrap().shift_remove(oid) {
            Some(_) => Ok(()),
            None => Err(SystemException::object_not_exist(0, CompletionStatus::No)
                .into_error(format!("object id {} is not active", hex::encode(oid)))),
        }
    }

    pub fn set_default_servant(&self, servant: Arc<dyn Servant>) -> Result<()> {
        if self.policies.request_processing != RequestProcessing::DefaultServant {
            return Err(wrong_policy("POA has no default-servant policy"));
        }
        *self.default_servant.lock().unwrap() = Some(servant);
        Ok(())
    }

    pub fn set_servant_manager(&self, manager: Arc<dyn ServantActivator>) -> Result<()> {
        if self.policies.request_processing != RequestProcessing::ServantManager {
            return Err(wrong_policy("POA has no servant-manager policy"));
        }
        *self.servant_manager.lock().unwrap() = Some(manager);
        Ok(())
    }

    pub fn set_adapter_activator(&self, activator: Arc<dyn AdapterActivator>) {
        *self.adapter_activator.lock().unwrap() = Some(activator);
    }

    /// Builds a reference addressing `oid` at this POA's endpoint without
    /// requiring activation.
    pub fn create_reference_with_id(&self, oid: &[u8], type_id: &str) -> Result<Ior> {
        if self.is_destroyed() {
            return Err(adapter_destroyed());
        }
        let (host, port) = &self.endpoint;
        Ok(Ior::new_iiop(type_id, host.clone(), *port, oid.to_vec()))
    }

    /// The object key a reference addresses.
    pub fn reference_to_id(&self, ior: &Ior) -> Result<ObjectKey> {
        Ok(ior.iiop_profile()?.object_key)
    }

    /// A reference for an active object, typed by its servant.
    pub fn id_to_reference(&self, oid: &[u8]) -> Result<Ior> {
        let servants = self.servants.lock().unwrap();
        let servant = servants.get(oid).ok_or_else(|| {
            SystemException::object_not_exist(0, CompletionStatus::No)
                .into_error(format!("object id {} is not active", hex::encode(oid)))
        })?;
        let (host, port) = &self.endpoint;
        Ok(Ior::new_iiop(
            servant.repository_id(),
            host.clone(),
            *port,
            oid.to_vec(),
        ))
    }

    pub fn id_to_servant(&self, oid: &[u8]) -> Option<Arc<dyn Servant>> {
        self.servants.lock().unwrap().get(oid).cloned()
    }

    /// Destroys this adapter and all descendants; their servants are
    /// dropped and further use fails.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let children: Vec<Arc<Poa>> = {
            let mut children = self.children.lock().unwrap();
            children.drain(..).map(|(_, child)| child).collect()
        };
        for child in children {
            child.destroy();
        }
        self.servants.lock().unwrap().clear();
        *self.default_servant.lock().unwrap() = None;
        if let Some(parent) = self.parent.upgrade() {
            parent.children.lock().unwrap().shift_remove(&self.name);
        }
        debug!("destroyed POA '{}'", self.name);
    }

    /// Depth-first search of the adapter tree for a key in an active map.
    fn locate_active(&self, key: &[u8]) -> Option<(Arc<Poa>, Arc<dyn Servant>)> {
        if let Some(servant) = self.servants.lock().unwrap().get(key).cloned() {
            return Some((self.me.upgrade()?, servant));
        }
        let children: Vec<Arc<Poa>> = self.children.lock().unwrap().values().cloned().collect();
        children.iter().find_map(|child| child.locate_active(key))
    }

    /// First default servant in the tree, for keys no active map knows.
    fn locate_default(&self) -> Option<(Arc<Poa>, Arc<dyn Servant>)> {
        if let Some(servant) = self.default_servant.lock().unwrap().clone() {
            return Some((self.me.upgrade()?, servant));
        }
        let children: Vec<Arc<Poa>> = self.children.lock().unwrap().values().cloned().collect();
        children.iter().find_map(|child| child.locate_default())
    }

    fn locate_servant_manager(&self) -> Option<(Arc<Poa>, Arc<dyn ServantActivator>)> {
        if let Some(manager) = self.servant_manager.lock().unwrap().clone() {
            return Some((self.me.upgrade()?, manager));
        }
        let children: Vec<Arc<Poa>> = self.children.lock().unwrap().values().cloned().collect();
        children
            .iter()
            .find_map(|child| child.locate_servant_manager())
    }

    pub(crate) fn knows_key(&self, key: &[u8]) -> bool {
        self.locate_active(key).is_some()
    }
}

/// Routes inbound GIOP requests into the POA tree: the ORB registers one of
/// these as the acceptor's handler.
pub(crate) struct PoaDispatcher {
    root: Arc<Poa>,
}

impl PoaDispatcher {
    pub(crate) fn new(root: Arc<Poa>) -> Arc<PoaDispatcher> {
        Arc::new(PoaDispatcher { root })
    }

    /// The dispatch algorithm: key, manager gate, servant lookup, implicit
    /// operations, then the servant hook. Failures marshal into the reply.
    async fn dispatch(
        &self,
        header: &RequestHeader,
        args: &[u8],
        order: ByteOrder,
        minor: u8,
    ) -> (ReplyStatus, Vec<u8>) {
        match self.dispatch_inner(header, args, order, minor).await {
            Ok(body) => (ReplyStatus::NoException, body),
            Err(OrbError::User(user)) => {
                let mut w = CdrWriter::with_giop_minor(order, minor);
                giop::encode_user_exception(&user, &mut w);
                (ReplyStatus::UserException, w.into_bytes())
            }
            Err(OrbError::System(system)) => {
                trace!(
                    "request {} '{}' failed: {system}",
                    header.request_id,
                    header.operation
                );
                let mut w = CdrWriter::with_giop_minor(order, minor);
                giop::encode_system_exception(&system, &mut w);
                (ReplyStatus::SystemException, w.into_bytes())
            }
        }
    }

    async fn dispatch_inner(
        &self,
        header: &RequestHeader,
        args: &[u8],
        order: ByteOrder,
        minor: u8,
    ) -> Result<Vec<u8>> {
        let key = header.target.object_key()?;

        match self.root.manager().wait_while_holding().await {
            PoaManagerState::Active => {}
            PoaManagerState::Discarding => {
                return Err(SystemException::transient(1, CompletionStatus::No)
                    .into_error("POAManager is discarding requests"));
            }
            PoaManagerState::Inactive | PoaManagerState::Holding => {
                return Err(SystemException::obj_adapter(0, CompletionStatus::No)
                    .into_error("POAManager is inactive"));
            }
        }

        let located = match self.root.locate_active(&key) {
            Some(found) => Some(found),
            None => self.root.locate_default(),
        };
        let (poa, servant) = match located {
            Some(found) => found,
            None => match self.root.locate_servant_manager() {
                Some((poa, manager)) => {
                    let servant = manager.incarnate(&key, &poa).await?;
                    poa.activate_object_with_id(&key, servant.clone()).ok();
                    (poa, servant)
                }
                None => {
                    return Err(SystemException::object_not_exist(0, CompletionStatus::No)
                        .into_error(format!("no servant for key {}", hex::encode(&key))))
                }
            },
        };

        // a child POA may answer to a different manager than the root
        if !Arc::ptr_eq(poa.manager(), self.root.manager()) {
            match poa.manager().wait_while_holding().await {
                PoaManagerState::Active => {}
                PoaManagerState::Discarding => {
                    return Err(SystemException::transient(1, CompletionStatus::No)
                        .into_error("POAManager is discarding requests"));
                }
                PoaManagerState::Inactive | PoaManagerState::Holding => {
                    return Err(SystemException::obj_adapter(0, CompletionStatus::No)
                        .into_error("POAManager is inactive"));
                }
            }
        }

        let mut input = CdrReader::with_giop_minor(args, order, minor);
        let mut output = CdrWriter::with_giop_minor(order, minor);

        match header.operation.as_str() {
            "_is_a" => {
                let probe = input.read_string()?;
                let matches = probe == servant.repository_id()
                    || probe == "IDL:omg.org/CORBA/Object:1.0";
                output.write_bool(matches);
            }
            "_non_existent" => {
                output.write_bool(false);
            }
            "_interface" => {
                return Err(SystemException::no_implement(0, CompletionStatus::No)
                    .into_error("no interface repository"));
            }
            "_get_component" => {
                Ior::nil().encode(&mut output);
            }
            operation => {
                servant.invoke(operation, &mut input, &mut output).await?;
            }
        }
        Ok(output.into_bytes())
    }
}

#[async_trait]
impl InboundHandler for PoaDispatcher {
    async fn handle_request(
        &self,
        conn: Arc<Connection>,
        header: RequestHeader,
        args: Vec<u8>,
        order: ByteOrder,
        minor: u8,
    ) {
        let (status, body) = self.dispatch(&header, &args, order, minor).await;
        if !header.response_expected() {
            return;
        }
        let reply = ReplyHeader {
            request_id: header.request_id,
            status,
            service_context: Vec::new(),
        };
        if let Err(e) = conn.send_reply(minor, order, &reply, &body).await {
            warn!(
                "failed to send reply {} to {}: {e}",
                header.request_id,
                conn.peer()
            );
        }
    }

    async fn handle_locate(
        &self,
        conn: Arc<Connection>,
        header: LocateRequestHeader,
        order: ByteOrder,
        minor: u8,
    ) {
        let status = match header.target.object_key() {
            Ok(key) if self.root.knows_key(&key) => LocateStatus::ObjectHere,
            _ => LocateStatus::UnknownObject,
        };
        let reply = LocateReplyHeader {
            request_id: header.request_id,
            status,
        };
        if let Err(e) = conn.send_locate_reply(minor, order, &reply, &[]).await {
            warn!("failed to send locate reply to {}: {e}", conn.peer());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullServant;

    #[async_trait]
    impl Servant for NullServant {
        fn repository_id(&self) -> &str {
            "IDL:Test/Null:1.0"
        }

        async fn invoke(
            &self,
            _operation: &str,
            _input: &mut CdrReader<'_>,
            _output: &mut CdrWriter,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn test_root() -> Arc<Poa> {
        Poa::new_root(
            ("127.0.0.1".to_string(), 4097),
            PoaManager::new(),
            PoaPolicies::default(),
        )
    }

    #[test]
    fn manager_transitions() {
        let manager = PoaManager::new();
        assert_eq!(manager.state(), PoaManagerState::Holding);
        manager.activate().unwrap();
        assert_eq!(manager.state(), PoaManagerState::Active);
        manager.discard_requests().unwrap();
        assert_eq!(manager.state(), PoaManagerState::Discarding);
        manager.hold_requests().unwrap();
        manager.deactivate().unwrap();
        assert_eq!(manager.state(), PoaManagerState::Inactive);
        // terminal
        assert!(manager.activate().is_err());
        assert!(manager.hold_requests().is_err());
        manager.deactivate().unwrap();
        assert_eq!(manager.state(), PoaManagerState::Inactive);
    }

    #[test]
    fn generated_keys_are_sixteen_octets() {
        let poa = test_root();
        let oid = poa.activate_object(Arc::new(NullServant)).unwrap();
        assert_eq!(oid.len(), 16);
        let again = poa.activate_object(Arc::new(NullServant)).unwrap();
        assert_ne!(oid, again);
    }

    #[test]
    fn activate_with_id_collision_is_bad_param() {
        use crate::error::SystemExceptionKind;
        let poa = test_root();
        poa.activate_object_with_id(b"echo", Arc::new(NullServant))
            .unwrap();
        let err = poa
            .activate_object_with_id(b"echo", Arc::new(NullServant))
            .unwrap_err();
        assert!(err.is_system(SystemExceptionKind::BadParam));
    }

    #[test]
    fn reference_id_round_trip() {
        let poa = test_root();
        let oid = poa.activate_object(Arc::new(NullServant)).unwrap();
        let ior = poa.id_to_reference(&oid).unwrap();
        assert_eq!(ior.type_id, "IDL:Test/Null:1.0");
        assert_eq!(poa.reference_to_id(&ior).unwrap(), oid);
    }

    #[test]
    fn sibling_names_are_unique() {
        use crate::error::SystemExceptionKind;
        let root = test_root();
        root.create_child("left", None, None).unwrap();
        let err = root.create_child("left", None, None).unwrap_err();
        assert!(err.is_system(SystemExceptionKind::BadParam));
        root.create_child("right", None, None).unwrap();
    }

    #[test]
    fn destroy_takes_descendants() {
        let root = test_root();
        let child = root.create_child("child", None, None).unwrap();
        let grandchild = child.create_child("grandchild", None, None).unwrap();
        let oid = grandchild.activate_object(Arc::new(NullServant)).unwrap();
        assert!(root.locate_active(&oid).is_some());

        child.destroy();
        assert!(grandchild.is_destroyed());
        assert!(root.locate_active(&oid).is_none());
        assert!(root.find_child("child").is_none());
        assert!(!root.is_destroyed());
    }

    #[test]
    fn lookup_crosses_the_tree() {
        let root = test_root();
        let child = root.create_child("svc", None, None).unwrap();
        child
            .activate_object_with_id(b"deep", Arc::new(NullServant))
            .unwrap();
        let (owner, _) = root.locate_active(b"deep").unwrap();
        assert_eq!(owner.name(), "svc");
        assert!(root.knows_key(b"deep"));
        assert!(!root.knows_key(b"missing"));
    }

    #[test]
    fn policy_guards() {
        use crate::error::SystemExceptionKind;
        let root = test_root();
        let err = root.set_default_servant(Arc::new(NullServant)).unwrap_err();
        assert!(err.is_system(SystemExceptionKind::InvPolicy));

        let child = root
            .create_child(
                "users",
                None,
                Some(PoaPolicies {
                    id_assignment: IdAssignment::User,
                    ..Default::default()
                }),
            )
            .unwrap();
        let err = child.activate_object(Arc::new(NullServant)).unwrap_err();
        assert!(err.is_system(SystemExceptionKind::InvPolicy));
        child
            .activate_object_with_id(b"explicit", Arc::new(NullServant))
            .unwrap();
    }

    #[tokio::test]
    async fn holding_parks_until_activate() {
        let manager = PoaManager::new();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_while_holding().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        manager.activate().unwrap();
        assert_eq!(waiter.await.unwrap(), PoaManagerState::Active);
    }
}
