use std::collections::BTreeMap;
use std::fmt;

use hyper::body::Bytes;
use tracing::{debug, info, trace, warn};

use super::transport::{HttpTransport, Transport};
use crate::error::{AuthenticationError, Fault, InvocationError, TransportError};
use crate::xmlrpc::{self, MethodResponse, Value};

/// Endpoint serving `authenticate` and `version`.
pub const COMMON_PATH: &str = "/xmlrpc/2/common";
/// Endpoint serving `execute_kw` on named models.
pub const OBJECT_PATH: &str = "/xmlrpc/2/object";

/// Account used to reach the remote server. Fixed for the client's lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub server_url: String,
    pub database: String,
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("server_url", &self.server_url)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// Remote user id returned by a successful `authenticate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle(i64);

impl SessionHandle {
    pub fn uid(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn mask_secret(value: &Value, secret: &str) -> Value {
    match value {
        Value::String(s) if !secret.is_empty() && s == secret => Value::from("***"),
        Value::Array(items) => Value::Array(items.iter().map(|v| mask_secret(v, secret)).collect()),
        Value::Struct(members) => Value::Struct(
            members
                .iter()
                .map(|(k, v)| (k.clone(), mask_secret(v, secret)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Authenticated XML-RPC access to remote models.
///
/// The client starts unauthenticated; [`authenticate`](Self::authenticate)
/// stores the session handle once and every later [`invoke`](Self::invoke)
/// sends it unchanged. There is no logout or re-authentication, and calls
/// are never retried.
pub struct RemoteModelClient<T = HttpTransport> {
    credentials: Credentials,
    transport: T,
    session: Option<SessionHandle>,
    log_requests: bool,
}

impl<T: Transport> RemoteModelClient<T> {
    pub fn new(credentials: Credentials, transport: T) -> Self {
        Self {
            credentials,
            transport,
            session: None,
            log_requests: false,
        }
    }

    /// Trace request bodies (secret masked) at `trace` level.
    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.session
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    fn endpoint(&self, path: &str) -> String {
        [self.credentials.server_url.trim_end_matches('/'), path].concat()
    }

    async fn call(&self, path: &str, method: &str, params: &[Value]) -> Result<MethodResponse, TransportError> {
        let url = self.endpoint(path);
        let body = xmlrpc::encode_call(method, params)?;

        if self.log_requests {
            let masked = self.masked_body(method, params)?;
            trace!(url = %url, body = %masked, "XML-RPC request");
        }

        let response = self.transport.post(&url, Bytes::from(body)).await?;
        Ok(xmlrpc::decode_response(&response)?)
    }

    /// Request body for the trace log, encoded with the secret swapped out.
    fn masked_body(&self, method: &str, params: &[Value]) -> Result<String, TransportError> {
        let masked: Vec<Value> = params
            .iter()
            .map(|p| mask_secret(p, &self.credentials.secret))
            .collect();
        let body = xmlrpc::encode_call(method, &masked)?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Unauthenticated `version()` on the common endpoint.
    pub async fn server_version(&self) -> Result<Value, TransportError> {
        match self.call(COMMON_PATH, "version", &[]).await? {
            MethodResponse::Success(value) => Ok(value),
            MethodResponse::Fault(Fault { message, .. }) => Err(TransportError::Malformed(
                format!("version() faulted: {message}"),
            )),
        }
    }

    /// Log in with the stored credentials and keep the returned handle.
    ///
    /// Calling this again after success returns the stored handle without
    /// contacting the server.
    pub async fn authenticate(&mut self) -> Result<SessionHandle, AuthenticationError> {
        if let Some(handle) = self.session {
            return Ok(handle);
        }

        let params = [
            Value::from(self.credentials.database.as_str()),
            Value::from(self.credentials.username.as_str()),
            Value::from(self.credentials.secret.as_str()),
            Value::Struct(BTreeMap::new()),
        ];

        debug!(
            database = %self.credentials.database,
            username = %self.credentials.username,
            "Authenticating"
        );

        let response = self
            .call(COMMON_PATH, "authenticate", &params)
            .await
            .map_err(AuthenticationError::Transport)?;

        let value = match response {
            MethodResponse::Success(value) => value,
            MethodResponse::Fault(fault) => {
                warn!(code = %fault.code, "Authentication fault");
                return Err(AuthenticationError::Fault(fault));
            }
        };

        match value {
            Value::Int(uid) if uid > 0 => {
                let handle = SessionHandle(uid);
                self.session = Some(handle);
                info!(uid = uid, "Authenticated");
                Ok(handle)
            }
            other if matches!(other, Value::Int(_)) || other.is_false_or_nil() => {
                Err(AuthenticationError::Rejected {
                    username: self.credentials.username.clone(),
                    database: self.credentials.database.clone(),
                })
            }
            other => Err(AuthenticationError::Transport(TransportError::Malformed(
                format!("authenticate returned {other:?}"),
            ))),
        }
    }

    /// Call `model.method(*args, **kwargs)` through `execute_kw`.
    ///
    /// The result is returned as sent. Faults come back verbatim in
    /// [`InvocationError::Fault`]; telling a validation fault from a
    /// permission fault is up to the caller.
    pub async fn invoke(
        &self,
        model: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, InvocationError> {
        let handle = self.session.ok_or(InvocationError::NotAuthenticated)?;

        let params = [
            Value::from(self.credentials.database.as_str()),
            Value::Int(handle.uid()),
            Value::from(self.credentials.secret.as_str()),
            Value::from(model),
            Value::from(method),
            Value::Array(args),
            Value::Struct(kwargs),
        ];

        debug!(model = %model, method = %method, "Invoking");

        match self
            .call(OBJECT_PATH, "execute_kw", &params)
            .await
            .map_err(InvocationError::Transport)?
        {
            MethodResponse::Success(value) => Ok(value),
            MethodResponse::Fault(fault) => {
                debug!(model = %model, method = %method, code = %fault.code, "Remote fault");
                Err(InvocationError::Fault(fault))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{Reply, ScriptedTransport, credentials};
    use serde_json::json;

    fn kwargs(value: serde_json::Value) -> BTreeMap<String, Value> {
        match Value::from(value) {
            Value::Struct(members) => members,
            other => panic!("not an object: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_authenticate_stores_handle() {
        let transport = ScriptedTransport::new([Reply::value(7)]);
        let mut client = RemoteModelClient::new(credentials(), transport);

        let handle = client.authenticate().await.unwrap();
        assert_eq!(handle.uid(), 7);
        assert_eq!(client.session(), Some(handle));

        let requests = client.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://erp.example.com/xmlrpc/2/common");
        assert_eq!(requests[0].method, "authenticate");
        assert_eq!(
            requests[0].params,
            vec![
                Value::from("prod"),
                Value::from("me@example.com"),
                Value::from("s3cret"),
                Value::Struct(BTreeMap::new()),
            ]
        );
    }

    #[tokio::test]
    async fn test_authenticate_twice_does_not_call_again() {
        let transport = ScriptedTransport::new([Reply::value(7)]);
        let mut client = RemoteModelClient::new(credentials(), transport);

        let first = client.authenticate().await.unwrap();
        let second = client.authenticate().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_authenticate_rejected() {
        let transport = ScriptedTransport::new([Reply::value(false)]);
        let mut client = RemoteModelClient::new(credentials(), transport);

        let err = client.authenticate().await.unwrap_err();
        assert!(matches!(err, AuthenticationError::Rejected { .. }));
        assert!(client.session().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_fault() {
        let transport = ScriptedTransport::new([Reply::fault(3, "database \"prod\" does not exist")]);
        let mut client = RemoteModelClient::new(credentials(), transport);

        match client.authenticate().await.unwrap_err() {
            AuthenticationError::Fault(fault) => {
                assert_eq!(fault.message, "database \"prod\" does not exist")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(client.session().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_transport_failure() {
        let transport = ScriptedTransport::new([Reply::Error(TransportError::Http(
            "connection reset".to_string(),
        ))]);
        let mut client = RemoteModelClient::new(credentials(), transport);

        let err = client.authenticate().await.unwrap_err();
        assert!(matches!(err, AuthenticationError::Transport(TransportError::Http(_))));
        assert!(client.session().is_none());
    }

    #[tokio::test]
    async fn test_authenticate_unexpected_shape() {
        let transport = ScriptedTransport::new([Reply::value("7")]);
        let mut client = RemoteModelClient::new(credentials(), transport);

        let err = client.authenticate().await.unwrap_err();
        assert!(matches!(
            err,
            AuthenticationError::Transport(TransportError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_invoke_before_authenticate_makes_no_call() {
        let transport = ScriptedTransport::new([]);
        let client = RemoteModelClient::new(credentials(), transport);

        let err = client
            .invoke("res.users", "read", vec![], BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::NotAuthenticated));
        assert!(client.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_payload_layout() {
        let transport = ScriptedTransport::new([Reply::value(7), Reply::Echo]);
        let mut client = RemoteModelClient::new(credentials(), transport);
        client.authenticate().await.unwrap();

        let echoed = client
            .invoke(
                "modelX",
                "methodY",
                vec![Value::Int(1), Value::Int(2)],
                kwargs(json!({"k": "v"})),
            )
            .await
            .unwrap();

        let expected = Value::from(json!(["prod", 7, "s3cret", "modelX", "methodY", [1, 2], {"k": "v"}]));
        assert_eq!(echoed, expected);

        let requests = client.transport.requests();
        assert_eq!(requests[1].url, "https://erp.example.com/xmlrpc/2/object");
        assert_eq!(requests[1].method, "execute_kw");
    }

    #[tokio::test]
    async fn test_invoke_fault_message_round_trips() {
        let message = "The operation cannot be completed:\n- Create/update: a mandatory field is not set.\n- Field: Channel Member";
        let transport = ScriptedTransport::new([Reply::value(7), Reply::fault(1, message)]);
        let mut client = RemoteModelClient::new(credentials(), transport);
        client.authenticate().await.unwrap();

        let err = client
            .invoke(
                "discuss.channel.rtc.session",
                "create",
                vec![Value::from(json!({"channel_id": 105}))],
                BTreeMap::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.fault_message(), Some(message));
    }

    #[tokio::test]
    async fn test_invoke_transport_error_is_wrapped() {
        let transport = ScriptedTransport::new([
            Reply::value(7),
            Reply::Error(TransportError::Status {
                status: 503,
                body: "maintenance".to_string(),
            }),
        ]);
        let mut client = RemoteModelClient::new(credentials(), transport);
        client.authenticate().await.unwrap();

        let err = client
            .invoke("res.users", "read", vec![], BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvocationError::Transport(TransportError::Status { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_sequential_invokes_share_only_the_handle() {
        let transport = ScriptedTransport::new([Reply::value(7), Reply::Echo, Reply::Echo]);
        let mut client = RemoteModelClient::new(credentials(), transport);
        client.authenticate().await.unwrap();

        client
            .invoke("a.model", "first", vec![Value::Int(1)], kwargs(json!({"x": 1})))
            .await
            .unwrap();
        let second = client
            .invoke("b.model", "second", vec![], BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(
            second,
            Value::from(json!(["prod", 7, "s3cret", "b.model", "second", [], {}]))
        );
    }

    #[tokio::test]
    async fn test_server_version() {
        let transport = ScriptedTransport::new([Reply::value(Value::from(
            json!({"server_version": "17.0", "protocol_version": 1}),
        ))]);
        let client = RemoteModelClient::new(credentials(), transport);

        let version = client.server_version().await.unwrap();
        assert_eq!(version.get("server_version").and_then(Value::as_str), Some("17.0"));
        assert!(client.session().is_none());
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn credentials_with_secret(secret: &str) -> Credentials {
        Credentials {
            secret: secret.to_string(),
            ..credentials()
        }
    }

    #[tokio::test]
    async fn test_request_log_never_contains_escaped_secret() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = ScriptedTransport::new([Reply::value(7), Reply::value(true)]);
        let mut client = RemoteModelClient::new(credentials_with_secret("p&ss<w>rd"), transport)
            .with_request_logging(true);
        client.authenticate().await.unwrap();
        client
            .invoke("modelX", "methodY", vec![], BTreeMap::new())
            .await
            .unwrap();

        let output = String::from_utf8(log.0.lock().clone()).unwrap();
        assert!(output.contains("XML-RPC request"));
        assert!(output.contains("***"));
        assert!(!output.contains("p&amp;ss&lt;w&gt;rd"));
        assert!(!output.contains("p&ss<w>rd"));
        assert!(!output.contains("ss&lt;w"));
    }

    #[test]
    fn test_masked_body_replaces_nested_secret() {
        let client = RemoteModelClient::new(
            credentials_with_secret("p&ss<w>rd"),
            ScriptedTransport::new([]),
        );
        let params = [
            Value::from("prod"),
            Value::from("p&ss<w>rd"),
            Value::from(json!({"token": "p&ss<w>rd", "other": "keep"})),
        ];

        let body = client.masked_body("authenticate", &params).unwrap();
        assert!(!body.contains("ss&lt;w"));
        assert!(body.contains("keep"));
        assert_eq!(body.matches("***").count(), 2);
    }

    #[test]
    fn test_credentials_debug_masks_secret() {
        let debug = format!("{:?}", credentials());
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let mut creds = credentials();
        creds.server_url = "https://erp.example.com/".to_string();
        let client = RemoteModelClient::new(creds, ScriptedTransport::new([]));
        assert_eq!(
            client.endpoint(OBJECT_PATH),
            "https://erp.example.com/xmlrpc/2/object"
        );
    }
}
