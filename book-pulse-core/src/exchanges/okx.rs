//! OKX public WebSocket protocol: control messages and inbound frame decoding

use serde::{Deserialize, Serialize};

use super::errors::ExchangeResult;
use super::types::{RawTick, Symbol};

/// Public endpoint of the OKX v5 WebSocket API
pub const DEFAULT_ENDPOINT: &str = "wss://ws.okx.com:8443/ws/v5/public";

/// Five-level book snapshot channel
pub const BOOK_CHANNEL: &str = "books5";

/// Text keepalive understood by the venue
pub const KEEPALIVE: &str = "ping";

/// Channel/instrument pair used in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelArg {
    pub channel: String,
    #[serde(rename = "instId", default, skip_serializing_if = "Option::is_none")]
    pub inst_id: Option<String>,
}

#[derive(Serialize)]
struct ControlRequest<'a> {
    op: &'a str,
    args: [ChannelArg; 1],
}

fn control_message(op: &str, channel: &str, symbol: &Symbol) -> String {
    let request = ControlRequest {
        op,
        args: [ChannelArg {
            channel: channel.to_string(),
            inst_id: Some(symbol.as_str().to_string()),
        }],
    };
    // Serializing a struct of strings cannot fail.
    serde_json::to_string(&request).unwrap_or_default()
}

/// `{"op":"subscribe","args":[{"channel":..,"instId":..}]}`
pub fn subscribe_message(channel: &str, symbol: &Symbol) -> String {
    control_message("subscribe", channel, symbol)
}

/// `{"op":"unsubscribe","args":[{"channel":..,"instId":..}]}`
pub fn unsubscribe_message(channel: &str, symbol: &Symbol) -> String {
    control_message("unsubscribe", channel, symbol)
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<ChannelArg>,
    #[serde(default)]
    data: Option<Vec<RawTick>>,
}

/// Decoded inbound frame
#[derive(Debug, Clone)]
pub enum Frame {
    /// Reply to the text keepalive.
    Pong,
    /// Subscribe/unsubscribe acknowledgement.
    Ack { event: String, arg: Option<ChannelArg> },
    /// The venue refused a control request.
    VenueError { code: String, message: String },
    /// Data push; `tick` is `data[0]` when present.
    Data { arg: ChannelArg, tick: Option<RawTick> },
    /// Well-formed JSON this consumer has no use for.
    Other,
}

/// Decode one text frame.
pub fn decode_frame(text: &str) -> ExchangeResult<Frame> {
    if text.trim() == "pong" {
        return Ok(Frame::Pong);
    }

    let frame: InboundFrame = serde_json::from_str(text)?;

    if let Some(event) = frame.event {
        if event == "error" {
            let code = match frame.code {
                Some(serde_json::Value::String(code)) => code,
                Some(other) => other.to_string(),
                None => String::new(),
            };
            return Ok(Frame::VenueError {
                code,
                message: frame.msg.unwrap_or_default(),
            });
        }
        return Ok(Frame::Ack { event, arg: frame.arg });
    }

    match (frame.arg, frame.data) {
        (Some(arg), Some(data)) => Ok(Frame::Data {
            arg,
            tick: data.into_iter().next(),
        }),
        _ => Ok(Frame::Other),
    }
}
