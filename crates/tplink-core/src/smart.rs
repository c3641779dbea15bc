//! SMART request layer: envelope wrapping, batching, child routing and the
//! per-device request queue.
//!
//! Every outbound SMART payload is wrapped as
//! `{method, params?, request_time_milis, terminal_uuid}` (the field name
//! spelling is the device firmware's). Requests targeting a child device are
//! nested inside a `control_child` envelope first; batches travel as
//! `multipleRequest` with per-entry error surfacing.
//!
//! A device serializes its requests through a single queue slot: the
//! transport sits behind an async mutex whose waiters wake in FIFO order, so
//! concurrent sends complete in submission order and a burst of first sends
//! triggers exactly one handshake.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    error::Error,
    transport::{DeviceConfig, Transport, create_transport},
};

/// One SMART method call, optionally with parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SmartRequest {
    /// SMART method name, e.g. `get_device_info`.
    pub method: String,
    /// Method parameters, if any.
    pub params: Option<Value>,
}

impl SmartRequest {
    /// Creates a parameterless request.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
        }
    }

    /// Creates a request with parameters.
    pub fn with_params(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params: Some(params),
        }
    }

    fn to_value(&self) -> Value {
        match &self.params {
            Some(params) => json!({ "method": self.method, "params": params }),
            None => json!({ "method": self.method }),
        }
    }
}

/// A SMART-capable device handle.
///
/// Owns the session transport and the per-device request queue. Cheap to
/// share behind an `Arc`; all operations take `&self`.
pub struct SmartDevice {
    transport: Mutex<Box<dyn Transport>>,
    host: String,
    port: u16,
    /// Parent device id, used to normalize short child ids.
    device_id: Option<String>,
    /// Stable for the device's lifetime; base64 of 16 random bytes.
    terminal_uuid: String,
}

impl SmartDevice {
    /// Creates a device handle for the configured transport. No I/O happens
    /// until the first command.
    pub fn new(config: &DeviceConfig) -> Result<Self, Error> {
        let transport = create_transport(config)?;
        let mut uuid_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut uuid_bytes);

        Ok(Self {
            host: config.host.clone(),
            port: config.effective_port(),
            transport: Mutex::new(transport),
            device_id: None,
            terminal_uuid: BASE64.encode(uuid_bytes),
        })
    }

    /// Sets the parent device id used for child-id normalization.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// The device host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The device port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sends a single SMART command and returns its result payload.
    ///
    /// With a `child_id`, the command is routed through `control_child` and
    /// the nested `responseData.result` is returned.
    pub async fn send_smart_command(
        &self,
        method: &str,
        params: Option<Value>,
        child_id: Option<&str>,
    ) -> Result<Value, Error> {
        let request = SmartRequest {
            method: method.to_string(),
            params,
        };
        let payload = self.wrap(&request.to_value(), child_id);
        let request_json = payload.to_string();

        let response = self.send_raw(&request_json).await?;
        unwrap_single(&response, method, child_id.is_some(), &request_json)
    }

    /// Sends a batch of SMART requests as one `multipleRequest` and returns
    /// the per-method results.
    ///
    /// The first entry with a non-zero `error_code` fails the whole call
    /// with [`Error::Smart`] naming that entry's method.
    pub async fn send_smart_requests(
        &self,
        requests: &[SmartRequest],
        child_id: Option<&str>,
    ) -> Result<HashMap<String, Value>, Error> {
        let entries: Vec<Value> = requests.iter().map(SmartRequest::to_value).collect();
        let batch = json!({
            "method": "multipleRequest",
            "params": { "requests": entries },
        });
        let payload = self.wrap(&batch, child_id);
        let request_json = payload.to_string();

        let response = self.send_raw(&request_json).await?;
        let envelope =
            unwrap_single(&response, "multipleRequest", child_id.is_some(), &request_json)?;
        unwrap_batch(&envelope, &request_json)
    }

    /// Resets the session. Idempotent; the next command re-handshakes.
    pub async fn close(&self) {
        let mut transport = self.transport.lock().await;
        transport.close().await;
    }

    /// Sends the serialized envelope through the queue slot and parses the
    /// response.
    async fn send_raw(&self, request_json: &str) -> Result<Value, Error> {
        debug!(host = %self.host, port = self.port, "queueing SMART request");
        let response_text = {
            let mut transport = self.transport.lock().await;
            transport.send(request_json).await?
        };
        serde_json::from_str(&response_text)
            .map_err(|e| Error::Protocol(format!("SMART response is not valid JSON: {}", e)))
    }

    /// Wraps an inner request for transport: optional `control_child`
    /// nesting, then timestamp and terminal UUID.
    fn wrap(&self, inner: &Value, child_id: Option<&str>) -> Value {
        let routed = match child_id {
            Some(child_id) => json!({
                "method": "control_child",
                "params": {
                    "device_id": self.normalized_child_id(child_id),
                    "requestData": inner,
                },
            }),
            None => inner.clone(),
        };

        let mut envelope = routed;
        if let Some(map) = envelope.as_object_mut() {
            map.insert("request_time_milis".into(), json!(now_millis()));
            map.insert(
                "terminal_uuid".into(),
                Value::String(self.terminal_uuid.clone()),
            );
        }
        envelope
    }

    /// Expands a positional child id (`"00"`, `"01"`, ...) to the full child
    /// device id by prefixing the parent id. Full-length ids pass through.
    fn normalized_child_id(&self, child_id: &str) -> String {
        match &self.device_id {
            Some(device_id) if child_id.len() < device_id.len() => {
                format!("{}{}", device_id, child_id)
            }
            _ => child_id.to_string(),
        }
    }
}

impl fmt::Debug for SmartDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartDevice")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Milliseconds since the Unix epoch, for `request_time_milis`.
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Validates a SMART response envelope and extracts its result payload.
///
/// With `child`, the top level is verified first, then `result.responseData`
/// is unwrapped and verified again.
fn unwrap_single(
    response: &Value,
    method: &str,
    child: bool,
    request_json: &str,
) -> Result<Value, Error> {
    let envelope = check_error_code(response, method, request_json)?;

    if !child {
        return Ok(envelope.get("result").cloned().unwrap_or(Value::Null));
    }

    let response_data = envelope
        .pointer("/result/responseData")
        .ok_or_else(|| Error::Protocol("control_child response has no responseData".into()))?;
    let inner = check_error_code(response_data, method, request_json)?;
    Ok(inner.get("result").cloned().unwrap_or(Value::Null))
}

/// Splits a `multipleRequest` envelope result into a per-method map,
/// surfacing the first failed entry.
fn unwrap_batch(result: &Value, request_json: &str) -> Result<HashMap<String, Value>, Error> {
    let responses = result
        .get("responses")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Protocol("multipleRequest response has no responses list".into()))?;

    let mut map = HashMap::with_capacity(responses.len());
    for entry in responses {
        let method = entry
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("batch entry has no method".into()))?;
        let code = entry
            .get("error_code")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Protocol("batch entry has no error_code".into()))?;
        if code != 0 {
            return Err(Error::Smart {
                code,
                method: method.to_string(),
                request_json: request_json.to_string(),
                response_json: entry.to_string(),
            });
        }
        map.insert(
            method.to_string(),
            entry.get("result").cloned().unwrap_or(Value::Null),
        );
    }
    Ok(map)
}

/// Verifies `error_code == 0` on an envelope and returns it for further
/// unwrapping.
fn check_error_code<'a>(
    envelope: &'a Value,
    method: &str,
    request_json: &str,
) -> Result<&'a Value, Error> {
    let code = envelope
        .get("error_code")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Protocol("SMART response has no error_code".into()))?;
    if code != 0 {
        return Err(Error::Smart {
            code,
            method: method.to_string(),
            request_json: request_json.to_string(),
            response_json: envelope.to_string(),
        });
    }
    Ok(envelope)
}
