// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shipment Update Payload
//!
//! The message carried through the broker: a UTF-8 JSON object with the
//! camelCase field names used by the producing API.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};

/// Content type attached to every published shipment update.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Geographic position reported with a status change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// A single shipment status event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentUpdate {
    pub shipment_id: String,
    pub status: String,
    /// ISO-8601 instant, e.g. `2024-01-01T00:00:00Z`.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl ShipmentUpdate {
    /// Creates an update without a location.
    pub fn new(
        shipment_id: impl Into<String>,
        status: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        ShipmentUpdate {
            shipment_id: shipment_id.into(),
            status: status.into(),
            timestamp: timestamp.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, lat: f64, lng: f64) -> Self {
        self.location = Some(Location { lat, lng });
        self
    }
}

/// Serializes an update into the canonical wire encoding.
pub fn encode(update: &ShipmentUpdate) -> Result<Vec<u8>, AmqpError> {
    if update.shipment_id.is_empty() {
        return Err(AmqpError::EncodingError(
            "shipmentId must not be empty".to_owned(),
        ));
    }

    if let Some(location) = update.location {
        if !location.lat.is_finite() || !location.lng.is_finite() {
            return Err(AmqpError::EncodingError(format!(
                "location must be finite, got lat={} lng={}",
                location.lat, location.lng
            )));
        }
    }

    serde_json::to_vec(update).map_err(|err| AmqpError::EncodingError(err.to_string()))
}

/// Parses a delivery body. Any non-JSON body, missing field or empty
/// `shipmentId` is an [`AmqpError::EncodingError`].
pub fn decode(body: &[u8]) -> Result<ShipmentUpdate, AmqpError> {
    let update: ShipmentUpdate =
        serde_json::from_slice(body).map_err(|err| AmqpError::EncodingError(err.to_string()))?;

    if update.shipment_id.is_empty() {
        return Err(AmqpError::EncodingError(
            "shipmentId must not be empty".to_owned(),
        ));
    }

    Ok(update)
}
