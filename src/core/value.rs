use super::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Attribute value as seen by request handlers.
///
/// Any serde-serializable type can be stored through [`to_attribute`].
pub type AttributeValue = serde_json::Value;

/// Converts a typed value into an attribute value.
pub fn to_attribute<T: Serialize>(value: &T) -> Result<AttributeValue> {
    Ok(serde_json::to_value(value)?)
}

/// Converts an attribute value back into a typed value.
pub fn from_attribute<T: DeserializeOwned>(value: &AttributeValue) -> Result<T> {
    Ok(T::deserialize(value)?)
}
