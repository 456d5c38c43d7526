//! Inspector wire codec
//!
//! Parses inbound frames into events and command responses, serializes
//! outbound commands, and decodes inspector error envelopes into the crate
//! error taxonomy. WebDriver-BiDi traffic tunneled through
//! `Runtime.bindingCalled` is unwrapped here so downstream consumers never
//! re-parse the payload string.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::error::{Error, Result};

/// Channels reserved for the driver's own CDP-over-BiDi traffic.
pub const RESERVED_CHANNEL_COUNT: i64 = 1;
/// Channels available to user-space BiDi commands.
pub const USER_CHANNEL_COUNT: i64 = 1;
/// Total channel count; on-wire BiDi ids are `user_id * MAX_CHANNEL_COUNT +
/// channel`, so the channel survives the round trip in the low bits.
pub const MAX_CHANNEL_COUNT: i64 = RESERVED_CHANNEL_COUNT + USER_CHANNEL_COUNT;

const METHOD_NOT_FOUND_CODE: i64 = -32601;
const SESSION_NOT_FOUND_CODE: i64 = -32001;
const INVALID_PARAMS_CODE: i64 = -32602;

const DEFAULT_CONTEXT_ERROR: &str = "Cannot find default execution context";
const CONTEXT_ERROR: &str = "Cannot find context with specified id";
const INVALID_URL_ERROR: &str = "Cannot navigate to invalid URL";
const INSECURE_CONTEXT_ERROR: &str = "Permission can't be granted in current context.";
const OPAQUE_ORIGINS_ERROR: &str = "Permission can't be granted to opaque origins.";
const PUSH_PERMISSION_ERROR: &str =
    "Push Permission without userVisibleOnly:true isn't supported";
const NO_SUCH_FRAME_ERROR: &str = "Frame with the given id was not found.";
const NO_TARGET_WITH_GIVEN_ID_ERROR: &str = "No target with given id found";

/// An asynchronous notification from the inspector.
#[derive(Debug, Clone)]
pub struct InspectorEvent {
    pub method: String,
    /// Always an object; defaults to `{}` when the frame carried none.
    pub params: Value,
}

/// A response correlated to a previously sent command.
#[derive(Debug, Clone)]
pub struct InspectorCommandResponse {
    pub id: i32,
    /// Present unless the inspector reported an error. Responses carrying
    /// neither `result` nor `error` get an empty object here: some methods
    /// (`Tracing.start`, `Tracing.end`) legitimately omit the result.
    pub result: Option<Value>,
    /// The raw error envelope as a JSON string, decoded lazily by
    /// [`parse_inspector_error`] only when the caller reads the slot.
    pub error: String,
}

/// One parsed inbound frame.
#[derive(Debug, Clone)]
pub enum InspectorMessage {
    Event(InspectorEvent),
    CommandResponse(InspectorCommandResponse),
}

/// A parsed frame plus its routing key.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Empty string routes to the root session.
    pub session_id: String,
    pub message: InspectorMessage,
}

/// Build an outbound command object.
pub fn build_command(id: i32, method: &str, params: Value, session_id: &str) -> Value {
    let mut command = Map::new();
    command.insert("id".to_string(), json!(id));
    command.insert("method".to_string(), json!(method));
    command.insert("params".to_string(), params);
    if !session_id.is_empty() {
        command.insert("sessionId".to_string(), json!(session_id));
    }
    Value::Object(command)
}

/// Serialize an outbound command for the wire.
pub fn serialize_command(command: &Value) -> Result<String> {
    Ok(serde_json::to_string(command)?)
}

/// Parse one inbound frame.
///
/// Invalid UTF-16 escape sequences are replaced rather than rejected:
/// inbound payloads may carry arbitrary ECMAScript test strings, lone
/// surrogates included.
pub fn parse_inspector_message(frame: &str) -> Result<ParsedMessage> {
    let value: Value = match serde_json::from_str(frame) {
        Ok(value) => value,
        Err(_) => serde_json::from_str(&replace_invalid_surrogate_escapes(frame))?,
    };
    let Value::Object(mut object) = value else {
        return Err(Error::unknown("inspector message is not an object"));
    };

    let session_id = object
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    match object.get("id") {
        None => {
            let event = parse_event(&mut object)?;
            Ok(ParsedMessage {
                session_id,
                message: InspectorMessage::Event(event),
            })
        }
        Some(id) => {
            let Some(id) = id.as_i64().and_then(|id| i32::try_from(id).ok()) else {
                return Err(Error::unknown("inspector message id is not an integer"));
            };
            let response = parse_command_response(id, &object)?;
            Ok(ParsedMessage {
                session_id,
                message: InspectorMessage::CommandResponse(response),
            })
        }
    }
}

fn parse_event(object: &mut Map<String, Value>) -> Result<InspectorEvent> {
    let Some(method) = object.get("method").and_then(Value::as_str) else {
        return Err(Error::unknown("inspector event has no method"));
    };
    let method = method.to_string();

    let mut params = match object.remove("params") {
        Some(Value::Object(params)) => Some(Value::Object(params)),
        _ => None,
    };

    if let Some(params) = params.as_mut() {
        if is_bidi_message(&method, params)? {
            unwrap_bidi_payload(params)?;
        }
    }

    Ok(InspectorEvent {
        method,
        params: params.unwrap_or_else(|| json!({})),
    })
}

fn parse_command_response(id: i32, object: &Map<String, Value>) -> Result<InspectorCommandResponse> {
    let mut response = InspectorCommandResponse {
        id,
        result: None,
        error: String::new(),
    };
    if let Some(result @ Value::Object(_)) = object.get("result") {
        response.result = Some(result.clone());
    } else if let Some(error @ Value::Object(_)) = object.get("error") {
        response.error = serde_json::to_string(error)?;
    } else {
        response.result = Some(json!({}));
    }
    Ok(response)
}

/// A `Runtime.bindingCalled` for the `sendBidiResponse` binding carries a
/// tunneled BiDi message in `params.payload`.
fn is_bidi_message(method: &str, params: &Value) -> Result<bool> {
    if method != "Runtime.bindingCalled" {
        return Ok(false);
    }
    let Some(name) = params.get("name") else {
        warn!("name is missing in the Runtime.bindingCalled params");
        return Err(Error::unknown(
            "name is missing in the Runtime.bindingCalled params",
        ));
    };
    Ok(name.as_str() == Some("sendBidiResponse"))
}

/// Decode `params.payload` in place and restore the user-space command id,
/// so the BiDi consumer gets an object rather than a string to re-parse.
fn unwrap_bidi_payload(params: &mut Value) -> Result<()> {
    let Some(payload_str) = params.get("payload").and_then(Value::as_str) else {
        warn!("payload is missing in the Runtime.bindingCalled params");
        return Err(Error::unknown(
            "payload is missing in the Runtime.bindingCalled params",
        ));
    };
    let Ok(mut payload) = serde_json::from_str::<Value>(payload_str) else {
        return Err(Error::unknown("unable to deserialize the BiDi payload"));
    };
    if !payload.is_object() {
        return Err(Error::unknown("unable to deserialize the BiDi payload"));
    }
    if let Some(cmd_id) = payload.get("id").and_then(Value::as_i64) {
        // A response: map the on-wire id back to the user-supplied one. The
        // channel in the low bits is dropped for now.
        payload["id"] = json!(cmd_id / MAX_CHANNEL_COUNT);
    }
    params["payload"] = payload;
    Ok(())
}

/// Decode an inspector error envelope into the error taxonomy.
pub fn parse_inspector_error(error_json: &str) -> Error {
    let Ok(Value::Object(error)) = serde_json::from_str::<Value>(error_json) else {
        return Error::unknown("inspector error with no error message");
    };

    let code = error.get("code").and_then(Value::as_i64);
    let message = error.get("message").and_then(Value::as_str);

    if let Some(code) = code {
        if code == METHOD_NOT_FOUND_CODE {
            return Error::unknown_command(message.unwrap_or("UnknownCommand"));
        }
        if code == SESSION_NOT_FOUND_CODE {
            return Error::no_such_frame(message.unwrap_or("inspector detached"));
        }
    }

    if let Some(message) = message {
        match message {
            DEFAULT_CONTEXT_ERROR | CONTEXT_ERROR => {
                return Error::no_such_window(message);
            }
            INVALID_URL_ERROR => return Error::invalid_argument(message),
            INSECURE_CONTEXT_ERROR => {
                return Error::invalid_argument("feature cannot be used in insecure context");
            }
            PUSH_PERMISSION_ERROR | OPAQUE_ORIGINS_ERROR => {
                return Error::invalid_argument(message);
            }
            // The server reports the generic -32000 here, so the message
            // content is the only signal.
            NO_SUCH_FRAME_ERROR => return Error::no_such_frame(message),
            _ => {}
        }
        if code == Some(INVALID_PARAMS_CODE) {
            if message == NO_TARGET_WITH_GIVEN_ID_ERROR {
                return Error::no_such_window(message);
            }
            return Error::invalid_argument(message);
        }
    }

    Error::unknown(format!("unhandled inspector error: {}", error_json))
}

/// Replace lone UTF-16 surrogate escapes (`\uD800`..`\uDFFF` outside a
/// valid pair) with `\uFFFD` so the frame still decodes.
fn replace_invalid_surrogate_escapes(frame: &str) -> String {
    const REPLACEMENT: &str = "\\uFFFD";
    let bytes = frame.as_bytes();
    let mut out = String::with_capacity(frame.len());
    let mut i = 0;

    while i < bytes.len() {
        match unicode_escape_at(bytes, i) {
            Some(code) if (0xD800..0xDC00).contains(&code) => {
                // High surrogate: valid only when a low surrogate follows.
                match unicode_escape_at(bytes, i + 6) {
                    Some(low) if (0xDC00..0xE000).contains(&low) => {
                        out.push_str(&frame[i..i + 12]);
                        i += 12;
                    }
                    _ => {
                        out.push_str(REPLACEMENT);
                        i += 6;
                    }
                }
            }
            Some(code) if (0xDC00..0xE000).contains(&code) => {
                out.push_str(REPLACEMENT);
                i += 6;
            }
            Some(_) => {
                out.push_str(&frame[i..i + 6]);
                i += 6;
            }
            None => {
                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                    // Skip any other escape whole so `\\u` is not mistaken
                    // for a unicode escape.
                    out.push_str(&frame[i..i + 2]);
                    i += 2;
                } else {
                    let ch_len = frame[i..].chars().next().map_or(1, char::len_utf8);
                    out.push_str(&frame[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }
    }
    out
}

/// Decode `\uXXXX` at byte offset `i`, if present.
fn unicode_escape_at(bytes: &[u8], i: usize) -> Option<u32> {
    if i + 6 > bytes.len() || bytes[i] != b'\\' || bytes[i + 1] != b'u' {
        return None;
    }
    let hex = std::str::from_utf8(&bytes[i + 2..i + 6]).ok()?;
    u32::from_str_radix(hex, 16).ok()
}
