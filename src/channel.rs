// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module opens connections and channels to the broker. A connection is
//! owned by the component that opened it and is never shared.

use crate::{
    config::BrokerConfig,
    errors::{connect_error, AmqpError},
};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use tracing::{debug, error, warn};

/// AMQP reply code for a normal close.
pub const REPLY_SUCCESS: u16 = 200;

/// Opens a connection to the broker named by `cfg.rabbitmq_url` and creates one
/// channel on it.
///
/// The attempt is bounded by `cfg.connect_timeout()`; a timeout is reported as
/// [`AmqpError::ConnectTimeout`].
///
/// # Example
/// ```no_run
/// # async fn run(cfg: &shipment_relay::config::BrokerConfig) -> Result<(), shipment_relay::errors::AmqpError> {
/// let (conn, channel) = shipment_relay::channel::new_amqp_channel(cfg).await?;
/// # Ok(()) }
/// ```
pub async fn new_amqp_channel(cfg: &BrokerConfig) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let timeout = cfg.connect_timeout();
    let conn = match tokio::time::timeout(timeout, Connection::connect(&cfg.rabbitmq_url, options))
        .await
    {
        Ok(Ok(c)) => Ok(c),
        Ok(Err(err)) => {
            error!(error = err.to_string(), "failure to connect");
            Err(connect_error(&err))
        }
        Err(_) => {
            error!(timeout = ?timeout, "connection attempt timed out");
            Err(AmqpError::ConnectTimeout(timeout))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!(channel_id = c.id(), "channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            close_connection(&conn, "channel creation failed").await;
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

/// Closes `conn`, logging instead of failing when it is already gone.
pub async fn close_connection(conn: &Connection, reason: &str) {
    if !conn.status().connected() {
        debug!(reason, "connection already closed");
        return;
    }

    match conn.close(REPLY_SUCCESS, reason).await {
        Ok(()) => debug!(reason, "amqp connection closed"),
        Err(err) => warn!(error = err.to_string(), reason, "failure to close connection"),
    }
}
