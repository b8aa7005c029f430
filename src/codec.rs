// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! JSON message encoding: UTF-8, compact separators, non-ASCII kept as is.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

pub fn encode<M: Serialize + ?Sized>(message: &M) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(message).map_err(|err| AmqpError::SerializationError(err.to_string()))
}

pub fn decode<M: DeserializeOwned>(body: &[u8]) -> Result<M, AmqpError> {
    serde_json::from_slice(body).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}
