// ABOUTME: Typed request/response shapes per (service, method) pair.
// ABOUTME: Decodes replies with serde and fails loudly when the shape does not match.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::codec::Envelope;
use crate::error::{Result, RpcError};

/// A single-result remote method with known request and response shapes.
///
/// ```ignore
/// struct GetVpc;
///
/// impl RpcMethod for GetVpc {
///     const SERVICE: &'static str = "Network.Vpc";
///     const METHOD: &'static str = "Get";
///     type Request = GetVpcRequest;
///     type Response = Vpc;
/// }
/// ```
pub trait RpcMethod {
    const SERVICE: &'static str;
    const METHOD: &'static str;
    type Request: Serialize;
    type Response: DeserializeOwned;

    /// `service.method`, as it appears in errors and logs.
    fn qualified_name() -> String {
        format!("{}.{}", Self::SERVICE, Self::METHOD)
    }
}

/// A list-style method whose reply is a stream of records under matching keys.
pub trait ListMethod: RpcMethod {
    type Record: DeserializeOwned;

    /// Whether a key of a `result` mapping names a record of this method.
    fn matches(key: &str) -> bool;
}

/// Build the envelope for `M` from its typed request.
pub fn envelope_for<M: RpcMethod>(request: &M::Request) -> Result<Envelope> {
    let mut envelope = Envelope::new(M::SERVICE, M::METHOD, Value::Null);
    let body = serde_json::to_value(request).map_err(|source| RpcError::Encode {
        method: envelope.qualified_method(),
        token: envelope.token.clone(),
        source,
    })?;
    envelope.params.body = body;
    Ok(envelope)
}

/// Decode a result mapping into `M::Response`.
pub fn decode_response<M: RpcMethod>(
    result: Map<String, Value>,
    envelope: &Envelope,
) -> Result<M::Response> {
    serde_json::from_value(Value::Object(result)).map_err(|e| RpcError::SchemaMismatch {
        method: envelope.qualified_method(),
        token: envelope.token.clone(),
        detail: e.to_string(),
    })
}
