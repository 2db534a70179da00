//! Wayland protocol layer
//!
//! [`wire`] frames and parses raw messages; [`interfaces`] describes the
//! interfaces the compositor implements and turns decoded messages into
//! typed requests.
//!
//! ```
//! use wally::protocol::{Argument, Interface, Message, Request};
//!
//! // wl_display.get_registry(new_id 2)
//! let bytes = Message::new(1, 1, vec![Argument::NewId(2)]).to_bytes().unwrap();
//! let (msg, _) = Message::decode(&bytes, |id, op| {
//!     Interface::Display.request_signature(id, op)
//! })
//! .unwrap();
//! assert_eq!(
//!     Request::parse(Interface::Display, &msg).unwrap(),
//!     Request::GetRegistry { registry: 2 }
//! );
//! ```

pub mod interfaces;
pub mod wire;

pub use interfaces::{error_code, event, format, shm_error, Interface, Request};
pub use wire::{
    ArgKind, Argument, CodecError, Fixed, Message, MessageHeader, MessageReader, HEADER_SIZE,
    MAX_MESSAGE_SIZE,
};
