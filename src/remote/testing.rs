//! In-memory transport that replays scripted XML-RPC replies.

use std::collections::VecDeque;

use hyper::body::Bytes;
use parking_lot::Mutex;

use super::client::Credentials;
use super::transport::Transport;
use crate::error::TransportError;
use crate::xmlrpc::Value;
use crate::xmlrpc::codec::{decode_call, encode_fault, encode_response};

pub fn credentials() -> Credentials {
    Credentials {
        server_url: "https://erp.example.com".to_string(),
        database: "prod".to_string(),
        username: "me@example.com".to_string(),
        secret: "s3cret".to_string(),
    }
}

pub enum Reply {
    Value(Value),
    Fault(i64, String),
    Error(TransportError),
    /// Answer with the request's params as an array.
    Echo,
}

impl Reply {
    pub fn value(v: impl Into<Value>) -> Self {
        Reply::Value(v.into())
    }

    pub fn fault(code: i64, message: &str) -> Self {
        Reply::Fault(code, message.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub url: String,
    pub method: String,
    pub params: Vec<Value>,
}

impl Recorded {
    /// `(model, method)` of an `execute_kw` call.
    pub fn target(&self) -> (&str, &str) {
        (
            self.params.get(3).and_then(Value::as_str).unwrap_or_default(),
            self.params.get(4).and_then(Value::as_str).unwrap_or_default(),
        )
    }

    pub fn args(&self) -> &[Value] {
        self.params.get(5).and_then(Value::as_array).unwrap_or_default()
    }

    pub fn kwargs(&self) -> Option<&Value> {
        self.params.get(6)
    }
}

pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

impl Transport for ScriptedTransport {
    async fn post(&self, url: &str, body: Bytes) -> Result<Bytes, TransportError> {
        let (method, params) = decode_call(&body).map_err(TransportError::from)?;
        self.requests.lock().push(Recorded {
            url: url.to_string(),
            method,
            params: params.clone(),
        });

        let reply = self
            .replies
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Http("no scripted reply left".to_string()))?;

        let encoded = match reply {
            Reply::Value(value) => encode_response(&value),
            Reply::Fault(code, message) => encode_fault(code, &message),
            Reply::Echo => encode_response(&Value::Array(params)),
            Reply::Error(e) => return Err(e),
        };
        Ok(Bytes::from(encoded.map_err(TransportError::from)?))
    }
}
