// SPDX-License-Identifier: Apache-2.0

//! Payload conversion.
//!
//! Decoding is split in two phases so that schema validation can run between
//! them: `parse` turns the raw body into a structural [`serde_json::Value`],
//! `materialize` turns the (possibly stripped) structural value into the
//! typed payload. When validation is disabled the one-shot [`convert`]
//! shortcut skips the intermediate value.
//!
//! [`convert`]: PayloadConverter::convert

use crate::client::RawMessage;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;

/// Longest body prefix echoed into decode errors.
const BODY_EXCERPT_LEN: usize = 256;

/// Errors produced while decoding a message body.
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    /// The body is not syntactically valid for the configured format.
    #[error("body is not valid JSON: {source} (body starts with {excerpt:?})")]
    Parse {
        /// The underlying parser error.
        #[source]
        source: serde_json::Error,
        /// The first bytes of the offending body, for logs.
        excerpt: String,
    },

    /// The structural value does not match the target payload type.
    #[error("payload does not match the target type: {0}")]
    Materialize(#[source] serde_json::Error),
}

/// Decodes raw message bodies into typed payloads.
pub trait PayloadConverter<T>: Send + Sync {
    /// Parses the raw body into a structural value.
    fn parse(&self, message: &RawMessage) -> Result<Value, ConvertError>;

    /// Materialises the typed payload from a structural value.
    fn materialize(&self, value: Value) -> Result<T, ConvertError>;

    /// One-shot conversion, used when no validation runs in between.
    fn convert(&self, message: &RawMessage) -> Result<T, ConvertError> {
        self.materialize(self.parse(message)?)
    }
}

/// The built-in JSON converter.
#[derive(Debug)]
pub struct JsonPayloadConverter<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonPayloadConverter<T> {
    /// Creates a JSON converter for payloads of type `T`.
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<T> Default for JsonPayloadConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> PayloadConverter<T> for JsonPayloadConverter<T> {
    fn parse(&self, message: &RawMessage) -> Result<Value, ConvertError> {
        serde_json::from_str(&message.body).map_err(|source| ConvertError::Parse {
            source,
            excerpt: body_excerpt(&message.body),
        })
    }

    fn materialize(&self, value: Value) -> Result<T, ConvertError> {
        serde_json::from_value(value).map_err(ConvertError::Materialize)
    }
}

fn body_excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT_LEN {
        return body.to_owned();
    }
    let mut end = BODY_EXCERPT_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        order_id: String,
        amount: f64,
    }

    fn message_with_body(body: &str) -> RawMessage {
        RawMessage {
            body: body.to_owned(),
            ..RawMessage::default()
        }
    }

    #[test]
    fn decodes_a_valid_body() {
        let converter = JsonPayloadConverter::<Order>::new();
        let order = converter
            .convert(&message_with_body(r#"{"order_id":"o-1","amount":12.5}"#))
            .expect("valid payload");
        assert_eq!(order.order_id, "o-1");
        assert_eq!(order.amount, 12.5);
    }

    #[test]
    fn round_trips_an_encoded_instance() {
        let body = serde_json::json!({"order_id": "o-2", "amount": 3.0}).to_string();
        let converter = JsonPayloadConverter::<Order>::new();
        let order = converter
            .convert(&message_with_body(&body))
            .expect("round trip");
        assert_eq!(
            order,
            Order {
                order_id: "o-2".to_owned(),
                amount: 3.0
            }
        );
    }

    #[test]
    fn parse_failure_carries_a_body_excerpt() {
        let converter = JsonPayloadConverter::<Order>::new();
        let err = converter
            .convert(&message_with_body("not json at all"))
            .expect_err("invalid body");
        match err {
            ConvertError::Parse { excerpt, .. } => assert_eq!(excerpt, "not json at all"),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundaries() {
        let body = "ü".repeat(300);
        let excerpt = body_excerpt(&body);
        assert!(excerpt.len() <= BODY_EXCERPT_LEN);
        assert!(body.starts_with(&excerpt));
    }

    #[test]
    fn materialize_failure_is_reported_separately() {
        let converter = JsonPayloadConverter::<Order>::new();
        let err = converter
            .convert(&message_with_body(r#"{"order_id": 7}"#))
            .expect_err("wrong shape");
        assert!(matches!(err, ConvertError::Materialize(_)));
    }
}
