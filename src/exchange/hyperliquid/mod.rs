//! Master venue integration: REST snapshots and the live event stream.

mod client;
mod types;
mod websocket;

pub use client::HyperliquidClient;
pub use types::{
    AssetPosition, ClearinghouseState, InfoRequest, MarginSummary, MasterEvent, MasterFillEvent,
    MasterOpenOrder, MasterOrderEvent, MasterOrderStatus, MasterSide, PerpPosition,
};
pub use websocket::{parse_events, MasterWebSocket};
