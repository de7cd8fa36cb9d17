//! Wire-independent message model for the shared broker connection
//!
//! Topic matching and validation, the v5 property codec, payload decoding
//! and the identity strings presented to the broker.

pub mod decode;
pub mod identity;
pub mod message;
pub mod properties;
pub mod topics;

pub use decode::{decode_inbound, DataType, DecodeError, DecodeErrorCode};
pub use identity::{ClientIdentity, InstanceKind};
pub use message::{InboundMessage, MessageProperties, OutboundMessage, Payload};
pub use properties::{PropertyBag, PropertyBagExt, PropertyValue};
pub use topics::{is_valid_publish_topic, is_valid_subscription_filter, matches};
