//! Exchange connectivity modules

pub mod errors;
pub mod okx;
pub mod types;
pub mod websocket;

pub use errors::{BookSide, ConfigError, ErrorKind, ExchangeError, ExchangeResult, Rejection};
pub use okx::{ChannelArg, Frame, BOOK_CHANNEL, DEFAULT_ENDPOINT};
pub use types::{ConnectionState, RawTick, Symbol};
pub use websocket::{OrderBookStream, ReconnectPolicy, StreamConfig};
