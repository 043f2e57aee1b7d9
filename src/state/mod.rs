//! State management module.
//!
//! Contains the Hub (shared broker state) and related entities.

mod hub;
mod room;
mod session;

pub use hub::{Hub, HubParams, ServerClock};
pub use room::{
    CallFailure, FunctionContext, FunctionEntry, Room, RoomFunction, Subscriber,
};
pub use session::SessionState;
