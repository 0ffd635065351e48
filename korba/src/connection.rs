use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, trace, warn};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio::time::timeout;

use crate::cdr::{ByteOrder, CdrReader, CdrWriter};
use crate::error::{
    comm_failure_io, CompletionStatus, OrbError, Result, SystemException,
};
use crate::giop::{
    self, code_sets_context, encode_message, encode_request_frame, read_frame,
    LocateRequestHeader, MessageHeader, MessageKind, ReplyHeader, RequestHeader, TargetAddress,
    RESPONSE_FLAGS_NONE, RESPONSE_FLAGS_NORMAL,
};
use crate::orb::OrbOptions;

/// A decoded Reply as it came off the wire; the body stays encoded so the
/// caller can interpret it against its own TypeCodes.
#[derive(Debug)]
pub struct ReplyEnvelope {
    pub header: ReplyHeader,
    pub body: Vec<u8>,
    pub order: ByteOrder,
    pub minor: u8,
}

/// Server-side sink for inbound work; the ORB's POA dispatcher implements
/// this. Client-only connections pass no handler and answer inbound
/// requests with MessageError.
#[async_trait::async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_request(
        &self,
        conn: Arc<Connection>,
        header: RequestHeader,
        args: Vec<u8>,
        order: ByteOrder,
        minor: u8,
    );

    async fn handle_locate(
        &self,
        conn: Arc<Connection>,
        header: LocateRequestHeader,
        order: ByteOrder,
        minor: u8,
    );
}

/// ORB-wide count of in-flight outbound requests, driving shutdown drain.
#[derive(Default)]
pub struct PendingGauge {
    count: AtomicUsize,
    notify: Notify,
}

impl PendingGauge {
    fn inc(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn dec(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

type PendingSender = oneshot::Sender<Result<ReplyEnvelope>>;

/// One TCP socket speaking GIOP. A single reader task parses frames and
/// demultiplexes: replies complete pending requests by id, requests go to
/// the inbound handler. Writes serialize through the send lock so frames
/// never interleave.
pub struct Connection {
    peer: String,
    writer: tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>,
    pending: Mutex<HashMap<u32, PendingSender>>,
    /// Request ids cancelled by the peer; their replies are suppressed.
    cancelled: Mutex<HashSet<u32>>,
    next_request_id: AtomicU32,
    closed: AtomicBool,
    sent_code_sets: AtomicBool,
    options: Arc<OrbOptions>,
    gauge: Arc<PendingGauge>,
}

impl Connection {
    /// Opens an outbound connection. Connect failures are `COMM_FAILURE`
    /// with `COMPLETED_NO`; a connect timeout is `TRANSIENT`.
    pub async fn connect(
        host: &str,
        port: u16,
        options: Arc<OrbOptions>,
        gauge: Arc<PendingGauge>,
        handler: Option<Arc<dyn InboundHandler>>,
    ) -> Result<Arc<Connection>> {
        let peer = format!("{host}:{port}");
        let stream = timeout(options.connect_timeout, TcpStream::connect(&peer))
            .await
            .map_err(|_| {
                SystemException::transient(0, CompletionStatus::No)
                    .into_error(format!("connect to {peer} timed out"))
            })?
            .map_err(|e| comm_failure_io(&e, CompletionStatus::No))?;
        Ok(Self::start(stream, peer, options, gauge, handler))
    }

    /// Wraps an accepted server-side socket.
    pub fn accept(
        stream: TcpStream,
        options: Arc<OrbOptions>,
        gauge: Arc<PendingGauge>,
        handler: Arc<dyn InboundHandler>,
    ) -> Arc<Connection> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        Self::start(stream, peer, options, gauge, Some(handler))
    }

    fn start(
        stream: TcpStream,
        peer: String,
        options: Arc<OrbOptions>,
        gauge: Arc<PendingGauge>,
        handler: Option<Arc<dyn InboundHandler>>,
    ) -> Arc<Connection> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Connection {
            peer,
            writer: tokio::sync::Mutex::new(BufWriter::new(write_half)),
            pending: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            next_request_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            sent_code_sets: AtomicBool::new(false),
            options,
            gauge,
        });
        debug!("connection to {} open", conn.peer);
        tokio::spawn(Connection::reader_loop(conn.clone(), read_half, handler));
        conn
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn allocate_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Sends a Request expecting a reply and awaits its correlated Reply,
    /// bounded by the per-request deadline.
    pub async fn invoke(
        &self,
        target: TargetAddress,
        operation: &str,
        args: Vec<u8>,
    ) -> Result<ReplyEnvelope> {
        if self.is_closed() {
            return Err(SystemException::comm_failure(0, CompletionStatus::No)
                .into_error(format!("connection to {} is closed", self.peer)));
        }
        let request_id = self.allocate_request_id();
        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.len() >= self.options.max_pending {
                return Err(SystemException::no_resources(0, CompletionStatus::No)
                    .into_error(format!(
                        "{} pending requests on {}",
                        pending.len(),
                        self.peer
                    )));
            }
            pending.insert(request_id, sender);
        }
        self.gauge.inc();

        let header = RequestHeader {
            request_id,
            response_flags: RESPONSE_FLAGS_NORMAL,
            target,
            operation: operation.to_string(),
            service_context: self.first_request_contexts(),
            principal: Vec::new(),
        };
        let frame = match encode_request_frame(
            self.options.giop_minor,
            self.options.byte_order,
            &header,
            &args,
        ) {
            Ok(frame) => frame,
            Err(e) => {
                self.forget_pending(request_id);
                return Err(e);
            }
        };
        trace!("request {} '{}' -> {}", request_id, operation, self.peer);
        if let Err(e) = self.send_frame(&frame).await {
            self.forget_pending(request_id);
            return Err(e);
        }

        match timeout(self.options.request_timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SystemException::comm_failure(0, CompletionStatus::Maybe)
                .into_error(format!("connection to {} lost", self.peer))),
            Err(_) => {
                self.forget_pending(request_id);
                if self.options.send_cancel_request {
                    let _ = self.send_cancel(request_id).await;
                }
                Err(SystemException::transient(0, CompletionStatus::Maybe)
                    .into_error(format!("request {request_id} to {} timed out", self.peer)))
            }
        }
    }

    /// Oneway: same framing with `responseFlags = 0`, no pending entry; the
    /// call resolves when the bytes are flushed.
    pub async fn send_oneway(
        &self,
        target: TargetAddress,
        operation: &str,
        args: Vec<u8>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(SystemException::comm_failure(0, CompletionStatus::No)
                .into_error(format!("connection to {} is closed", self.peer)));
        }
        let header = RequestHeader {
            request_id: self.allocate_request_id(),
            response_flags: RESPONSE_FLAGS_NONE,
            target,
            operation: operation.to_string(),
            service_context: self.first_request_contexts(),
            principal: Vec::new(),
        };
        let frame = encode_request_frame(
            self.options.giop_minor,
            self.options.byte_order,
            &header,
            &args,
        )?;
        self.send_frame(&frame).await
    }

    /// Sends a LocateRequest and awaits the correlated LocateReply's status.
    pub async fn locate(
        &self,
        target: TargetAddress,
    ) -> Result<giop::LocateStatus> {
        if self.is_closed() {
            return Err(SystemException::comm_failure(0, CompletionStatus::No)
                .into_error(format!("connection to {} is closed", self.peer)));
        }
        let request_id = self.allocate_request_id();
        let (sender, receiver) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.len() >= self.options.max_pending {
                return Err(SystemException::no_resources(0, CompletionStatus::No)
                    .into_error(format!("{} pending requests on {}", pending.len(), self.peer)));
            }
            pending.insert(request_id, sender);
        }
        self.gauge.inc();

        let header = LocateRequestHeader { request_id, target };
        let mut w = CdrWriter::with_giop_minor(self.options.byte_order, self.options.giop_minor);
        let frame = match header.encode(&mut w) {
            Ok(()) => encode_message(
                MessageKind::LocateRequest,
                self.options.giop_minor,
                self.options.byte_order,
                false,
                &w.into_bytes(),
            ),
            Err(e) => {
                self.forget_pending(request_id);
                return Err(e);
            }
        };
        if let Err(e) = self.send_frame(&frame).await {
            self.forget_pending(request_id);
            return Err(e);
        }

        match timeout(self.options.request_timeout, receiver).await {
            Ok(Ok(outcome)) => {
                let envelope = outcome?;
                let mut r = CdrReader::new(&envelope.body, envelope.order);
                giop::LocateStatus::from_wire(r.read_u32()?)
            }
            Ok(Err(_)) => Err(SystemException::comm_failure(0, CompletionStatus::Maybe)
                .into_error(format!("connection to {} lost", self.peer))),
            Err(_) => {
                self.forget_pending(request_id);
                Err(SystemException::transient(0, CompletionStatus::Maybe)
                    .into_error(format!("locate request to {} timed out", self.peer)))
            }
        }
    }

    /// Sends a Reply for a served request, unless the peer cancelled it.
    pub async fn send_reply(
        &self,
        minor: u8,
        order: ByteOrder,
        header: &ReplyHeader,
        body: &[u8],
    ) -> Result<()> {
        if self.cancelled.lock().unwrap().remove(&header.request_id) {
            debug!(
                "suppressing reply {} to {}: cancelled by peer",
                header.request_id, self.peer
            );
            return Ok(());
        }
        let frame = giop::encode_reply_frame(minor, order, header, body)?;
        self.send_frame(&frame).await
    }

    pub async fn send_locate_reply(
        &self,
        minor: u8,
        order: ByteOrder,
        header: &giop::LocateReplyHeader,
        body: &[u8],
    ) -> Result<()> {
        let mut w = CdrWriter::with_giop_minor(order, minor);
        header.encode(&mut w);
        w.write_octets(body);
        let frame = encode_message(MessageKind::LocateReply, minor, order, false, &w.into_bytes());
        self.send_frame(&frame).await
    }

    async fn send_cancel(&self, request_id: u32) -> Result<()> {
        let order = self.options.byte_order;
        let mut w = CdrWriter::with_giop_minor(order, self.options.giop_minor);
        w.write_u32(request_id);
        let frame = encode_message(
            MessageKind::CancelRequest,
            self.options.giop_minor,
            order,
            false,
            &w.into_bytes(),
        );
        self.send_frame(&frame).await
    }

    /// Announces orderly shutdown; the peer must stop issuing requests on
    /// this socket.
    pub async fn send_close_connection(&self) -> Result<()> {
        let frame = encode_message(
            MessageKind::CloseConnection,
            self.options.giop_minor,
            self.options.byte_order,
            false,
            &[],
        );
        self.send_frame(&frame).await
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            comm_failure_io(&e, CompletionStatus::Maybe)
        })
    }

    fn first_request_contexts(&self) -> Vec<giop::ServiceContext> {
        if self.sent_code_sets.swap(true, Ordering::SeqCst) {
            Vec::new()
        } else {
            vec![code_sets_context()]
        }
    }

    fn forget_pending(&self, request_id: u32) {
        if self.pending.lock().unwrap().remove(&request_id).is_some() {
            self.gauge.dec();
        }
    }

    fn complete_pending(&self, request_id: u32, outcome: Result<ReplyEnvelope>) {
        let sender = self.pending.lock().unwrap().remove(&request_id);
        match sender {
            Some(sender) => {
                self.gauge.dec();
                let _ = sender.send(outcome);
            }
            None => debug!(
                "reply for unknown request {request_id} from {} dropped",
                self.peer
            ),
        }
    }

    fn fail_all_pending(&self, make_error: impl Fn() -> OrbError) {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, sender)| sender).collect()
        };
        for sender in drained {
            self.gauge.dec();
            let _ = sender.send(Err(make_error()));
        }
    }

    async fn reader_loop(
        conn: Arc<Connection>,
        mut read_half: OwnedReadHalf,
        handler: Option<Arc<dyn InboundHandler>>,
    ) {
        // in-progress GIOP 1.2 fragment chains, keyed by request id
        let mut fragments: HashMap<u32, (MessageKind, Vec<u8>)> = HashMap::new();
        let mut orderly_close = false;

        loop {
            let frame = match timeout(conn.options.idle_timeout, read_frame(&mut read_half)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    if e.is_system(crate::error::SystemExceptionKind::Marshal) {
                        warn!("unparseable frame from {}: {e}", conn.peer);
                        let frame = encode_message(
                            MessageKind::MessageError,
                            conn.options.giop_minor,
                            conn.options.byte_order,
                            false,
                            &[],
                        );
                        let _ = conn.send_frame(&frame).await;
                    } else {
                        debug!("connection to {} dropped: {e}", conn.peer);
                    }
                    break;
                }
                Err(_) => {
                    debug!("connection to {} idle, closing", conn.peer);
                    break;
                }
            };
            let (header, body) = frame;

            let (kind, body) = if header.more_fragments || header.kind == MessageKind::Fragment {
                match Connection::reassemble(&conn, &mut fragments, header, body) {
                    Some(complete) => complete,
                    None => continue,
                }
            } else {
                (header.kind, body)
            };

            match kind {
                MessageKind::Reply => {
                    match giop::decode_reply_frame(header.minor, header.order, &body) {
                        Ok((reply_header, reply_body)) => {
                            let request_id = reply_header.request_id;
                            trace!("reply {} <- {}", request_id, conn.peer);
                            conn.complete_pending(
                                request_id,
                                Ok(ReplyEnvelope {
                                    header: reply_header,
                                    body: reply_body.to_vec(),
                                    order: header.order,
                                    minor: header.minor,
                                }),
                            );
                        }
                        Err(e) => {
                            warn!("bad reply from {}: {e}", conn.peer);
                            break;
                        }
                    }
                }
                MessageKind::Request => {
                    let Some(handler) = handler.as_ref() else {
                        warn!("unexpected request on client connection to {}", conn.peer);
                        let frame = encode_message(
                            MessageKind::MessageError,
                            conn.options.giop_minor,
                            conn.options.byte_order,
                            false,
                            &[],
                        );
                        let _ = conn.send_frame(&frame).await;
                        continue;
                    };
                    match giop::decode_request_frame(header.minor, header.order, &body) {
                        Ok((request_header, args)) => {
                            let handler = handler.clone();
                            let conn = conn.clone();
                            let args = args.to_vec();
                            tokio::spawn(async move {
                                handler
                                    .handle_request(conn, request_header, args, header.order, header.minor)
                                    .await;
                            });
                        }
                        Err(e) => {
                            warn!("bad request from {}: {e}", conn.peer);
                            break;
                        }
                    }
                }
                MessageKind::LocateRequest => {
                    let Some(handler) = handler.as_ref() else {
                        continue;
                    };
                    let mut r = CdrReader::with_giop_minor(&body, header.order, header.minor);
                    match LocateRequestHeader::decode(&mut r) {
                        Ok(locate) => {
                            let handler = handler.clone();
                            let conn = conn.clone();
                            tokio::spawn(async move {
                                handler
                                    .handle_locate(conn, locate, header.order, header.minor)
                                    .await;
                            });
                        }
                        Err(e) => {
                            warn!("bad locate request from {}: {e}", conn.peer);
                            break;
                        }
                    }
                }
                MessageKind::CancelRequest => {
                    let mut r = CdrReader::with_giop_minor(&body, header.order, header.minor);
                    if let Ok(request_id) = r.read_u32() {
                        trace!("peer {} cancelled request {request_id}", conn.peer);
                        conn.cancelled.lock().unwrap().insert(request_id);
                    }
                }
                MessageKind::CloseConnection => {
                    debug!("{} sent CloseConnection", conn.peer);
                    orderly_close = true;
                    break;
                }
                MessageKind::MessageError => {
                    error!("{} reported a message error", conn.peer);
                    break;
                }
                MessageKind::LocateReply | MessageKind::Fragment => {
                    // LocateReply correlation rides the normal pending table
                    let mut r = CdrReader::with_giop_minor(&body, header.order, header.minor);
                    if kind == MessageKind::LocateReply {
                        match giop::LocateReplyHeader::decode(&mut r) {
                            Ok(locate) => {
                                conn.complete_pending(
                                    locate.request_id,
                                    Ok(ReplyEnvelope {
                                        header: ReplyHeader {
                                            request_id: locate.request_id,
                                            status: giop::ReplyStatus::NoException,
                                            service_context: Vec::new(),
                                        },
                                        body: {
                                            let mut tail =
                                                Vec::with_capacity(4 + r.remaining());
                                            let mut w = CdrWriter::new(header.order);
                                            w.write_u32(locate.status.to_wire());
                                            tail.extend_from_slice(&w.into_bytes());
                                            tail.extend_from_slice(r.remaining_bytes());
                                            tail
                                        },
                                        order: header.order,
                                        minor: header.minor,
                                    }),
                                );
                            }
                            Err(e) => {
                                warn!("bad locate reply from {}: {e}", conn.peer);
                                break;
                            }
                        }
                    }
                }
            }
        }

        conn.closed.store(true, Ordering::SeqCst);
        if orderly_close {
            // unanswered requests were not processed and are safe to retry
            conn.fail_all_pending(|| {
                SystemException::transient(0, CompletionStatus::No)
                    .into_error("peer closed the connection")
            });
        } else {
            conn.fail_all_pending(|| {
                SystemException::comm_failure(0, CompletionStatus::Maybe)
                    .into_error("connection lost with requests in flight")
            });
        }
        debug!("connection to {} closed", conn.peer);
    }

    /// GIOP 1.2 fragment reassembly: the initial fragmented message and all
    /// continuation fragments carry the request id up front.
    fn reassemble(
        conn: &Arc<Connection>,
        fragments: &mut HashMap<u32, (MessageKind, Vec<u8>)>,
        header: MessageHeader,
        body: Vec<u8>,
    ) -> Option<(MessageKind, Vec<u8>)> {
        if header.minor < 2 {
            warn!("fragmented GIOP 1.{} message from {} dropped", header.minor, conn.peer);
            return None;
        }
        let request_id = {
            if body.len() < 4 {
                warn!("fragment without request id from {}", conn.peer);
                return None;
            }
            let raw: [u8; 4] = body[0..4].try_into().unwrap();
            match header.order {
                ByteOrder::Big => u32::from_be_bytes(raw),
                ByteOrder::Little => u32::from_le_bytes(raw),
            }
        };
        match header.kind {
            MessageKind::Fragment => {
                let Some((_, accumulated)) = fragments.get_mut(&request_id) else {
                    warn!("orphan fragment {request_id} from {}", conn.peer);
                    return None;
                };
                accumulated.extend_from_slice(&body[4..]);
                if header.more_fragments {
                    None
                } else {
                    fragments.remove(&request_id)
                }
            }
            kind => {
                fragments.insert(request_id, (kind, body));
                None
            }
        }
    }
}
