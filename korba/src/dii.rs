use log::trace;
use tokio::sync::oneshot;

use crate::cdr::CdrWriter;
use crate::codec::{decode_value, encode_value};
use crate::error::{CompletionStatus, Result, SystemException};
use crate::object::ObjectRef;
use crate::orb::ReplyBody;
use crate::typecode::TypeCode;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamMode {
    In,
    Out,
    InOut,
}

#[derive(Clone, Debug)]
pub struct Parameter {
    pub mode: ParamMode,
    pub tc: TypeCode,
    pub value: Value,
}

/// A dynamically assembled invocation: parameters annotated with TypeCodes,
/// a return TypeCode, and the send variants of the DII. IN/INOUT parameters
/// marshal into the request; the reply yields the return value first, then
/// OUT/INOUT parameters in declaration order.
pub struct Request {
    target: ObjectRef,
    operation: String,
    params: Vec<Parameter>,
    return_tc: TypeCode,
    return_value: Value,
    deferred: Option<oneshot::Receiver<Result<ReplyBody>>>,
    ready: Option<Result<ReplyBody>>,
}

impl Request {
    pub fn new(target: ObjectRef, operation: impl Into<String>) -> Request {
        Request {
            target,
            operation: operation.into(),
            params: Vec::new(),
            return_tc: TypeCode::Void,
            return_value: Value::Void,
            deferred: None,
            ready: None,
        }
    }

    pub fn add_in_arg(&mut self, tc: TypeCode, value: Value) -> &mut Self {
        self.params.push(Parameter {
            mode: ParamMode::In,
            tc,
            value,
        });
        self
    }

    pub fn add_inout_arg(&mut self, tc: TypeCode, value: Value) -> &mut Self {
        self.params.push(Parameter {
            mode: ParamMode::InOut,
            tc,
            value,
        });
        self
    }

    pub fn add_out_arg(&mut self, tc: TypeCode) -> &mut Self {
        self.params.push(Parameter {
            mode: ParamMode::Out,
            tc,
            value: Value::Null,
        });
        self
    }

    pub fn set_return_type(&mut self, tc: TypeCode) -> &mut Self {
        self.return_tc = tc;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn return_value(&self) -> &Value {
        &self.return_value
    }

    /// Parameter values after a completed invocation; OUT/INOUT slots carry
    /// what the reply delivered.
    pub fn param(&self, index: usize) -> Option<&Parameter> {
        self.params.get(index)
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let options = self.target.orb().options();
        let mut w = CdrWriter::with_giop_minor(options.byte_order, options.giop_minor);
        for param in &self.params {
            if matches!(param.mode, ParamMode::In | ParamMode::InOut) {
                encode_value(&param.tc, &param.value, &mut w)?;
            }
        }
        Ok(w.into_bytes())
    }

    fn decode_reply(&mut self, reply: &ReplyBody) -> Result<()> {
        let mut r = reply.reader();
        self.return_value = decode_value(&self.return_tc, &mut r)?;
        for param in &mut self.params {
            if matches!(param.mode, ParamMode::Out | ParamMode::InOut) {
                param.value = decode_value(&param.tc, &mut r)?;
            }
        }
        Ok(())
    }

    /// Synchronous invoke: marshal, send, decode.
    pub async fn invoke(&mut self) -> Result<()> {
        let body = self.encode_body()?;
        let reply = self
            .target
            .orb()
            .invoke_with_encoded(&self.target, &self.operation, body)
            .await?;
        self.decode_reply(&reply)
    }

    /// Oneway send; no reply is ever expected.
    pub async fn send_oneway(&self) -> Result<()> {
        let body = self.encode_body()?;
        self.target
            .orb()
            .send_oneway(&self.target, &self.operation, body)
            .await
    }

    /// Launches the invocation without awaiting it; pair with
    /// `poll_response` / `get_response`.
    pub fn send_deferred(&mut self) -> Result<()> {
        if self.deferred.is_some() || self.ready.is_some() {
            return Err(SystemException::bad_inv_order(0, CompletionStatus::No)
                .into_error("request already sent"));
        }
        let body = self.encode_body()?;
        let orb = self.target.orb().clone();
        let target = self.target.clone();
        let operation = self.operation.clone();
        let (sender, receiver) = oneshot::channel();
        trace!("deferred send of '{operation}'");
        tokio::spawn(async move {
            let outcome = orb.invoke_with_encoded(&target, &operation, body).await;
            let _ = sender.send(outcome);
        });
        self.deferred = Some(receiver);
        Ok(())
    }

    /// True once a deferred reply has arrived; never blocks.
    pub fn poll_response(&mut self) -> bool {
        if self.ready.is_some() {
            return true;
        }
        let Some(receiver) = self.deferred.as_mut() else {
            return false;
        };
        match receiver.try_recv() {
            Ok(outcome) => {
                self.ready = Some(outcome);
                self.deferred = None;
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.ready = Some(Err(SystemException::comm_failure(
                    0,
                    CompletionStatus::Maybe,
                )
                .into_error("deferred request lost")));
                self.deferred = None;
                true
            }
        }
    }

    /// Awaits a deferred reply and decodes it into the request.
    pub async fn get_response(&mut self) -> Result<()> {
        let outcome = if let Some(outcome) = self.ready.take() {
            outcome
        } else if let Some(receiver) = self.deferred.take() {
            receiver.await.unwrap_or_else(|_| {
                Err(SystemException::comm_failure(0, CompletionStatus::Maybe)
                    .into_error("deferred request lost"))
            })
        } else {
            return Err(SystemException::bad_inv_order(0, CompletionStatus::No)
                .into_error("no deferred request outstanding"));
        };
        let reply = outcome?;
        self.decode_reply(&reply)
    }
}
