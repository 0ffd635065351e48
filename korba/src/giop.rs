use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cdr::{ByteOrder, CdrReader, CdrWriter};
use crate::error::{
    comm_failure_io, marshal, CompletionStatus, Result, SystemException, UserException,
};
use crate::ior::{Ior, TaggedProfile};

pub const GIOP_MAGIC: [u8; 4] = *b"GIOP";
pub const GIOP_HEADER_LEN: usize = 12;
pub const GIOP_MAJOR: u8 = 1;

/// Refuse to buffer messages past this; the wire format itself allows up
/// to 2^32 - 1 octets.
pub const MAX_MESSAGE_SIZE: usize = 1 << 30;

pub const SERVICE_CONTEXT_CODE_SETS: u32 = 1;

/// CONV_FRAME::CodeSetContext charset ids: UTF-8 / UTF-16.
pub const CHARSET_UTF8: u32 = 0x0501_0001;
pub const CHARSET_UTF16: u32 = 0x0001_0109;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Reply,
    CancelRequest,
    LocateRequest,
    LocateReply,
    CloseConnection,
    MessageError,
    Fragment,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => MessageKind::Request,
            1 => MessageKind::Reply,
            2 => MessageKind::CancelRequest,
            3 => MessageKind::LocateRequest,
            4 => MessageKind::LocateReply,
            5 => MessageKind::CloseConnection,
            6 => MessageKind::MessageError,
            7 => MessageKind::Fragment,
            x => return Err(marshal(format!("invalid GIOP message type {x}"))),
        })
    }
}

/// The fixed 12-octet GIOP message header. Magic and version are always
/// big-endian; `flags` bit 0 selects the endianness of the size field and
/// the body, bit 1 marks a fragmented message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub minor: u8,
    pub order: ByteOrder,
    pub more_fragments: bool,
    pub kind: MessageKind,
    pub size: u32,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; GIOP_HEADER_LEN] {
        let mut flags = self.order.flag();
        if self.more_fragments {
            flags |= 2;
        }
        let size = match self.order {
            ByteOrder::Big => self.size.to_be_bytes(),
            ByteOrder::Little => self.size.to_le_bytes(),
        };
        [
            GIOP_MAGIC[0],
            GIOP_MAGIC[1],
            GIOP_MAGIC[2],
            GIOP_MAGIC[3],
            GIOP_MAJOR,
            self.minor,
            flags,
            self.kind as u8,
            size[0],
            size[1],
            size[2],
            size[3],
        ]
    }

    pub fn decode(raw: &[u8; GIOP_HEADER_LEN]) -> Result<Self> {
        if raw[0..4] != GIOP_MAGIC {
            return Err(marshal("bad GIOP magic"));
        }
        if raw[4] != GIOP_MAJOR || raw[5] > 2 {
            return Err(marshal(format!("unsupported GIOP version {}.{}", raw[4], raw[5])));
        }
        let order = ByteOrder::from_flag(raw[6]);
        let size_raw: [u8; 4] = raw[8..12].try_into().unwrap();
        let size = match order {
            ByteOrder::Big => u32::from_be_bytes(size_raw),
            ByteOrder::Little => u32::from_le_bytes(size_raw),
        };
        Ok(MessageHeader {
            minor: raw[5],
            order,
            more_fragments: raw[6] & 2 != 0,
            kind: MessageKind::from_u8(raw[7])?,
            size,
        })
    }
}

/// Reads one framed message off the wire: the fixed header, then exactly
/// `size` body octets.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(MessageHeader, Vec<u8>)> {
    let mut raw = [0u8; GIOP_HEADER_LEN];
    reader
        .read_exact(&mut raw)
        .await
        .map_err(|e| comm_failure_io(&e, CompletionStatus::Maybe))?;
    let header = MessageHeader::decode(&raw)?;
    if header.size as usize > MAX_MESSAGE_SIZE {
        return Err(marshal(format!("message of {} octets refused", header.size)));
    }
    let mut body = vec![0u8; header.size as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| comm_failure_io(&e, CompletionStatus::Maybe))?;
    Ok((header, body))
}

/// Frames a complete message for a single write.
pub fn encode_message(
    kind: MessageKind,
    minor: u8,
    order: ByteOrder,
    more_fragments: bool,
    body: &[u8],
) -> Vec<u8> {
    let header = MessageHeader {
        minor,
        order,
        more_fragments,
        kind,
        size: body.len() as u32,
    };
    let mut out = Vec::with_capacity(GIOP_HEADER_LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(body);
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceContext {
    pub id: u32,
    pub data: Vec<u8>,
}

pub fn encode_service_contexts(contexts: &[ServiceContext], w: &mut CdrWriter) {
    w.write_u32(contexts.len() as u32);
    for context in contexts {
        w.write_u32(context.id);
        w.write_octet_seq(&context.data);
    }
}

pub fn decode_service_contexts(r: &mut CdrReader<'_>) -> Result<Vec<ServiceContext>> {
    let count = r.read_sequence_len()?;
    let mut contexts = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let id = r.read_u32()?;
        let data = r.read_octet_seq()?;
        contexts.push(ServiceContext { id, data });
    }
    Ok(contexts)
}

/// The CONV_FRAME::CodeSetContext announcing UTF-8 chars and UTF-16 wchars,
/// sent once on a connection's first request.
pub fn code_sets_context() -> ServiceContext {
    let mut w = CdrWriter::new(ByteOrder::Big);
    w.write_octet(w.order().flag());
    w.write_u32(CHARSET_UTF8);
    w.write_u32(CHARSET_UTF16);
    ServiceContext {
        id: SERVICE_CONTEXT_CODE_SETS,
        data: w.into_bytes(),
    }
}

/// GIOP 1.2 request target; 1.0/1.1 only ever use the object-key form.
#[derive(Clone, Debug, PartialEq)]
pub enum TargetAddress {
    Key(Vec<u8>),
    Profile(TaggedProfile),
    Reference { profile_index: u32, ior: Ior },
}

impl TargetAddress {
    /// The object key, when the target carries one directly or through an
    /// IIOP profile.
    pub fn object_key(&self) -> Result<Vec<u8>> {
        match self {
            TargetAddress::Key(key) => Ok(key.clone()),
            TargetAddress::Profile(profile) => {
                Ok(crate::ior::IiopProfile::from_tagged(profile)?.object_key)
            }
            TargetAddress::Reference { profile_index, ior } => {
                let profile = ior
                    .profiles
                    .get(*profile_index as usize)
                    .ok_or_else(|| marshal("reference target profile index out of range"))?;
                Ok(crate::ior::IiopProfile::from_tagged(profile)?.object_key)
            }
        }
    }

    fn encode(&self, w: &mut CdrWriter) -> Result<()> {
        match self {
            TargetAddress::Key(key) => {
                w.write_u16(0);
                w.write_octet_seq(key);
            }
            TargetAddress::Profile(profile) => {
                w.write_u16(1);
                w.write_u32(profile.id);
                w.write_octet_seq(&profile.data);
            }
            TargetAddress::Reference { profile_index, ior } => {
                w.write_u16(2);
                w.write_u32(*profile_index);
                ior.encode(w);
            }
        }
        Ok(())
    }

    fn decode(r: &mut CdrReader<'_>) -> Result<Self> {
        Ok(match r.read_u16()? {
            0 => TargetAddress::Key(r.read_octet_seq()?),
            1 => {
                let id = r.read_u32()?;
                let data = r.read_octet_seq()?;
                TargetAddress::Profile(TaggedProfile { id, data })
            }
            2 => {
                let profile_index = r.read_u32()?;
                let ior = Ior::decode(r)?;
                TargetAddress::Reference { profile_index, ior }
            }
            x => return Err(marshal(format!("invalid addressing disposition {x}"))),
        })
    }
}

pub const RESPONSE_FLAGS_NONE: u8 = 0x00;
pub const RESPONSE_FLAGS_NORMAL: u8 = 0x03;

#[derive(Clone, Debug, PartialEq)]
pub struct RequestHeader {
    pub request_id: u32,
    pub response_flags: u8,
    pub target: TargetAddress,
    pub operation: String,
    pub service_context: Vec<ServiceContext>,
    /// GIOP 1.0/1.1 only.
    pub principal: Vec<u8>,
}

impl RequestHeader {
    pub fn response_expected(&self) -> bool {
        self.response_flags != RESPONSE_FLAGS_NONE
    }

    pub fn encode(&self, w: &mut CdrWriter) -> Result<()> {
        if w.giop_minor() >= 2 {
            w.write_u32(self.request_id);
            w.write_octet(self.response_flags);
            w.write_octets(&[0, 0, 0]);
            self.target.encode(w)?;
            w.write_string(&self.operation);
            encode_service_contexts(&self.service_context, w);
        } else {
            encode_service_contexts(&self.service_context, w);
            w.write_u32(self.request_id);
            w.write_bool(self.response_expected());
            if w.giop_minor() == 1 {
                w.write_octets(&[0, 0]);
            }
            let key = self.target.object_key()?;
            w.write_octet_seq(&key);
            w.write_string(&self.operation);
            w.write_octet_seq(&self.principal);
        }
        Ok(())
    }

    pub fn decode(r: &mut CdrReader<'_>) -> Result<Self> {
        if r.giop_minor() >= 2 {
            let request_id = r.read_u32()?;
            let response_flags = r.read_octet()?;
            r.read_octets(3)?;
            let target = TargetAddress::decode(r)?;
            let operation = r.read_string()?;
            let service_context = decode_service_contexts(r)?;
            Ok(RequestHeader {
                request_id,
                response_flags,
                target,
                operation,
                service_context,
                principal: Vec::new(),
            })
        } else {
            let service_context = decode_service_contexts(r)?;
            let request_id = r.read_u32()?;
            let response_expected = r.read_bool()?;
            if r.giop_minor() == 1 {
                r.read_octets(2)?;
            }
            let key = r.read_octet_seq()?;
            let operation = r.read_string()?;
            let principal = r.read_octet_seq()?;
            Ok(RequestHeader {
                request_id,
                response_flags: if response_expected {
                    RESPONSE_FLAGS_NORMAL
                } else {
                    RESPONSE_FLAGS_NONE
                },
                target: TargetAddress::Key(key),
                operation,
                service_context,
                principal,
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyStatus {
    NoException,
    UserException,
    SystemException,
    LocationForward,
    LocationForwardPerm,
    NeedsAddressingMode,
}

impl ReplyStatus {
    pub fn to_wire(self) -> u32 {
        match self {
            ReplyStatus::NoException => 0,
            ReplyStatus::UserException => 1,
            ReplyStatus::SystemException => 2,
            ReplyStatus::LocationForward => 3,
            ReplyStatus::LocationForwardPerm => 4,
            ReplyStatus::NeedsAddressingMode => 5,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self> {
        Ok(match value {
            0 => ReplyStatus::NoException,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::SystemException,
            3 => ReplyStatus::LocationForward,
            4 => ReplyStatus::LocationForwardPerm,
            5 => ReplyStatus::NeedsAddressingMode,
            x => return Err(marshal(format!("invalid reply status {x}"))),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReplyHeader {
    pub request_id: u32,
    pub status: ReplyStatus,
    pub service_context: Vec<ServiceContext>,
}

impl ReplyHeader {
    pub fn encode(&self, w: &mut CdrWriter) -> Result<()> {
        if w.giop_minor() >= 2 {
            w.write_u32(self.request_id);
            w.write_u32(self.status.to_wire());
            encode_service_contexts(&self.service_context, w);
        } else {
            encode_service_contexts(&self.service_context, w);
            w.write_u32(self.request_id);
            w.write_u32(self.status.to_wire());
        }
        Ok(())
    }

    pub fn decode(r: &mut CdrReader<'_>) -> Result<Self> {
        if r.giop_minor() >= 2 {
            let request_id = r.read_u32()?;
            let status = ReplyStatus::from_wire(r.read_u32()?)?;
            let service_context = decode_service_contexts(r)?;
            Ok(ReplyHeader {
                request_id,
                status,
                service_context,
            })
        } else {
            let service_context = decode_service_contexts(r)?;
            let request_id = r.read_u32()?;
            let status = ReplyStatus::from_wire(r.read_u32()?)?;
            Ok(ReplyHeader {
                request_id,
                status,
                service_context,
            })
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocateRequestHeader {
    pub request_id: u32,
    pub target: TargetAddress,
}

impl LocateRequestHeader {
    pub fn encode(&self, w: &mut CdrWriter) -> Result<()> {
        w.write_u32(self.request_id);
        if w.giop_minor() >= 2 {
            self.target.encode(w)?;
        } else {
            w.write_octet_seq(&self.target.object_key()?);
        }
        Ok(())
    }

    pub fn decode(r: &mut CdrReader<'_>) -> Result<Self> {
        let request_id = r.read_u32()?;
        let target = if r.giop_minor() >= 2 {
            TargetAddress::decode(r)?
        } else {
            TargetAddress::Key(r.read_octet_seq()?)
        };
        Ok(LocateRequestHeader { request_id, target })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocateStatus {
    UnknownObject,
    ObjectHere,
    ObjectForward,
}

impl LocateStatus {
    pub fn to_wire(self) -> u32 {
        match self {
            LocateStatus::UnknownObject => 0,
            LocateStatus::ObjectHere => 1,
            LocateStatus::ObjectForward => 2,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self> {
        Ok(match value {
            0 => LocateStatus::UnknownObject,
            1 => LocateStatus::ObjectHere,
            2 => LocateStatus::ObjectForward,
            x => return Err(marshal(format!("invalid locate status {x}"))),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocateReplyHeader {
    pub request_id: u32,
    pub status: LocateStatus,
}

impl LocateReplyHeader {
    pub fn encode(&self, w: &mut CdrWriter) {
        w.write_u32(self.request_id);
        w.write_u32(self.status.to_wire());
    }

    pub fn decode(r: &mut CdrReader<'_>) -> Result<Self> {
        Ok(LocateReplyHeader {
            request_id: r.read_u32()?,
            status: LocateStatus::from_wire(r.read_u32()?)?,
        })
    }
}

/// Assembles a complete Request frame. The argument body is spliced as its
/// own alignment region; GIOP 1.2 additionally pads the header to an 8-octet
/// boundary when arguments are present.
pub fn encode_request_frame(
    minor: u8,
    order: ByteOrder,
    header: &RequestHeader,
    args: &[u8],
) -> Result<Vec<u8>> {
    let mut w = CdrWriter::with_giop_minor(order, minor);
    header.encode(&mut w)?;
    if minor >= 2 && !args.is_empty() {
        w.align(8);
    }
    w.write_octets(args);
    Ok(encode_message(MessageKind::Request, minor, order, false, &w.into_bytes()))
}

/// Parses a Request body, returning the header and the argument region.
pub fn decode_request_frame<'a>(
    minor: u8,
    order: ByteOrder,
    body: &'a [u8],
) -> Result<(RequestHeader, &'a [u8])> {
    let mut r = CdrReader::with_giop_minor(body, order, minor);
    let header = RequestHeader::decode(&mut r)?;
    if minor >= 2 && r.remaining() > 0 {
        r.align(8)?;
    }
    Ok((header, r.remaining_bytes()))
}

pub fn encode_reply_frame(
    minor: u8,
    order: ByteOrder,
    header: &ReplyHeader,
    body: &[u8],
) -> Result<Vec<u8>> {
    let mut w = CdrWriter::with_giop_minor(order, minor);
    header.encode(&mut w)?;
    if minor >= 2 && !body.is_empty() {
        w.align(8);
    }
    w.write_octets(body);
    Ok(encode_message(MessageKind::Reply, minor, order, false, &w.into_bytes()))
}

pub fn decode_reply_frame<'a>(
    minor: u8,
    order: ByteOrder,
    body: &'a [u8],
) -> Result<(ReplyHeader, &'a [u8])> {
    let mut r = CdrReader::with_giop_minor(body, order, minor);
    let header = ReplyHeader::decode(&mut r)?;
    if minor >= 2 && r.remaining() > 0 {
        r.align(8)?;
    }
    Ok((header, r.remaining_bytes()))
}

/// The body of a `SYSTEM_EXCEPTION` reply.
pub fn encode_system_exception(exception: &SystemException, w: &mut CdrWriter) {
    w.write_string(&exception.repository_id());
    w.write_u32(exception.minor);
    w.write_u32(exception.completed.to_wire());
}

pub fn decode_system_exception(r: &mut CdrReader<'_>) -> Result<SystemException> {
    let repository_id = r.read_string()?;
    let minor = r.read_u32()?;
    let completed = CompletionStatus::from_wire(r.read_u32()?)?;
    Ok(SystemException::new(
        SystemException::kind_from_repository_id(&repository_id),
        minor,
        completed,
    ))
}

/// The body of a `USER_EXCEPTION` reply: repository id, then the members as
/// the requester's typed layer left them.
pub fn encode_user_exception(exception: &UserException, w: &mut CdrWriter) {
    w.write_string(&exception.repository_id);
    w.write_octets(&exception.body);
}

pub fn decode_user_exception(r: &mut CdrReader<'_>) -> Result<UserException> {
    let repository_id = r.read_string()?;
    Ok(UserException::new(repository_id, r.remaining_bytes().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_both_orders() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let header = MessageHeader {
                minor: 2,
                order,
                more_fragments: false,
                kind: MessageKind::Reply,
                size: 0x0102_0304,
            };
            assert_eq!(MessageHeader::decode(&header.encode()).unwrap(), header);
        }
    }

    #[test]
    fn header_rejects_bad_magic_and_version() {
        let mut raw = MessageHeader {
            minor: 2,
            order: ByteOrder::Big,
            more_fragments: false,
            kind: MessageKind::Request,
            size: 0,
        }
        .encode();
        raw[0] = b'X';
        assert!(MessageHeader::decode(&raw).is_err());
        raw[0] = b'G';
        raw[5] = 9;
        assert!(MessageHeader::decode(&raw).is_err());
    }

    #[test]
    fn fragment_flag_survives() {
        let header = MessageHeader {
            minor: 2,
            order: ByteOrder::Little,
            more_fragments: true,
            kind: MessageKind::Fragment,
            size: 4,
        };
        let decoded = MessageHeader::decode(&header.encode()).unwrap();
        assert!(decoded.more_fragments);
        assert_eq!(decoded.order, ByteOrder::Little);
    }

    fn sample_request(_minor: u8) -> RequestHeader {
        RequestHeader {
            request_id: 42,
            response_flags: RESPONSE_FLAGS_NORMAL,
            target: TargetAddress::Key(vec![1, 2, 3, 4]),
            operation: "echo".to_string(),
            service_context: vec![ServiceContext {
                id: 7,
                data: vec![9],
            }],
            principal: Vec::new(),
        }
    }

    #[test]
    fn request_round_trip_all_versions() {
        for minor in [0u8, 1, 2] {
            for order in [ByteOrder::Big, ByteOrder::Little] {
                let header = sample_request(minor);
                let args = b"\x01\x02\x03";
                let frame = encode_request_frame(minor, order, &header, args).unwrap();
                let decoded_header = MessageHeader::decode(&frame[..12].try_into().unwrap()).unwrap();
                assert_eq!(decoded_header.kind, MessageKind::Request);
                assert_eq!(decoded_header.minor, minor);
                let (parsed, parsed_args) =
                    decode_request_frame(minor, order, &frame[12..]).unwrap();
                assert_eq!(parsed.request_id, 42);
                assert_eq!(parsed.operation, "echo");
                assert_eq!(parsed.target.object_key().unwrap(), vec![1, 2, 3, 4]);
                assert_eq!(parsed_args, args);
                assert_eq!(parsed.service_context, header.service_context);
            }
        }
    }

    #[test]
    fn giop12_body_is_8_aligned() {
        let header = sample_request(2);
        let frame = encode_request_frame(2, ByteOrder::Big, &header, b"zzzz").unwrap();
        let body = &frame[12..];
        let args_offset = body.len() - 4;
        assert_eq!(args_offset % 8, 0);
    }

    #[test]
    fn oneway_flags() {
        let mut header = sample_request(0);
        header.response_flags = RESPONSE_FLAGS_NONE;
        let frame = encode_request_frame(0, ByteOrder::Big, &header, &[]).unwrap();
        let (parsed, _) = decode_request_frame(0, ByteOrder::Big, &frame[12..]).unwrap();
        assert!(!parsed.response_expected());
    }

    #[test]
    fn reply_round_trip_all_versions() {
        for minor in [0u8, 1, 2] {
            let header = ReplyHeader {
                request_id: 7,
                status: ReplyStatus::NoException,
                service_context: vec![],
            };
            let frame = encode_reply_frame(minor, ByteOrder::Little, &header, b"ret").unwrap();
            let (parsed, body) = decode_reply_frame(minor, ByteOrder::Little, &frame[12..]).unwrap();
            assert_eq!(parsed, header);
            assert_eq!(body, b"ret");
        }
    }

    #[test]
    fn system_exception_body_round_trip() {
        let exception = SystemException::object_not_exist(2, CompletionStatus::No);
        let mut w = CdrWriter::new(ByteOrder::Big);
        encode_system_exception(&exception, &mut w);
        let bytes = w.into_bytes();
        let mut r = CdrReader::new(&bytes, ByteOrder::Big);
        let decoded = decode_system_exception(&mut r).unwrap();
        assert_eq!(decoded.kind, exception.kind);
        assert_eq!(decoded.minor, 2);
        assert_eq!(decoded.completed, CompletionStatus::No);
    }

    #[test]
    fn target_address_forms() {
        for target in [
            TargetAddress::Key(vec![5, 6]),
            TargetAddress::Profile(crate::ior::IiopProfile::new("h", 1, vec![7]).to_tagged()),
            TargetAddress::Reference {
                profile_index: 0,
                ior: Ior::new_iiop("IDL:T:1.0", "h", 1, vec![8]),
            },
        ] {
            let mut w = CdrWriter::with_giop_minor(ByteOrder::Big, 2);
            target.encode(&mut w).unwrap();
            let bytes = w.into_bytes();
            let mut r = CdrReader::with_giop_minor(&bytes, ByteOrder::Big, 2);
            let decoded = TargetAddress::decode(&mut r).unwrap();
            assert_eq!(decoded, target);
            assert!(decoded.object_key().is_ok());
        }
    }

    #[test]
    fn locate_round_trip() {
        for minor in [0u8, 2] {
            let header = LocateRequestHeader {
                request_id: 3,
                target: TargetAddress::Key(vec![1]),
            };
            let mut w = CdrWriter::with_giop_minor(ByteOrder::Big, minor);
            header.encode(&mut w).unwrap();
            let bytes = w.into_bytes();
            let mut r = CdrReader::with_giop_minor(&bytes, ByteOrder::Big, minor);
            let decoded = LocateRequestHeader::decode(&mut r).unwrap();
            assert_eq!(decoded.request_id, 3);
            assert_eq!(decoded.target.object_key().unwrap(), vec![1]);
        }

        let reply = LocateReplyHeader {
            request_id: 3,
            status: LocateStatus::ObjectHere,
        };
        let mut w = CdrWriter::new(ByteOrder::Big);
        reply.encode(&mut w);
        let bytes = w.into_bytes();
        let mut r = CdrReader::new(&bytes, ByteOrder::Big);
        assert_eq!(LocateReplyHeader::decode(&mut r).unwrap(), reply);
    }
}
