pub mod error;
pub mod types;
pub mod value;

pub use error::{Result, SessionError};
pub use types::{OwnerId, Payload, SessionId};
pub use value::{AttributeValue, from_attribute, to_attribute};
