// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Shipment Delivery Pipeline
//!
//! `AmqpError` covers every broker-facing failure: connecting, declaring topology,
//! publishing, consuming and resolving deliveries. Each variant is classified as
//! either [`ErrorClass::Transient`] (eligible for the supervisor's retry loop) or
//! [`ErrorClass::Fatal`] (surfaced immediately).

use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use std::time::Duration;
use thiserror::Error;

/// Whether a failure may be retried by the connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Broker unavailable or connection lost; retrying may succeed.
    Transient,
    /// Retrying with the same parameters cannot succeed.
    Fatal,
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The broker could not be reached or dropped the connection
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection attempt did not complete in time
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The broker refused the credentials or the virtual host
    #[error("authentication refused: {0}")]
    AuthenticationError(String),

    /// The peer violated the AMQP protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// An entity already exists with different parameters
    #[error("topology conflict on `{0}`")]
    TopologyConflict(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// A passive declare found no such queue
    #[error("queue `{0}` does not exist")]
    QueueNotFound(String),

    /// A message body could not be encoded or decoded
    #[error("failure to encode or decode payload: {0}")]
    EncodingError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker negatively confirmed or returned the message
    #[error("message rejected by the broker: {0}")]
    PublishRejected(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error: {0}")]
    ConsumerDeclarationError(String),

    /// The delivery stream failed or ended
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A shutdown was requested while waiting on the broker
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

impl AmqpError {
    /// Classifies this error for the retry loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            AmqpError::ConnectionError(_)
            | AmqpError::ConnectTimeout(_)
            | AmqpError::ChannelError(_)
            | AmqpError::AckMessageError(_)
            | AmqpError::NackMessageError(_)
            | AmqpError::ConsumerError(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// Shorthand for `class() == ErrorClass::Transient`.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Failure returned by the single-shot publish path.
///
/// Wraps whichever step failed; no retry has been attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failure to publish shipment update: {cause}")]
pub struct PublishError {
    #[source]
    pub cause: AmqpError,
}

impl From<AmqpError> for PublishError {
    fn from(cause: AmqpError) -> Self {
        PublishError { cause }
    }
}

/// Failure reported by a message handler. The delivery is rejected without requeue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Coarse reading of a lapin error, shared by every call site that maps one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    Unavailable,
    AccessRefused,
    Conflict,
    NotFound,
    Protocol,
    Other,
}

pub(crate) fn failure_kind(err: &lapin::Error) -> FailureKind {
    match err {
        lapin::Error::IOError(_)
        | lapin::Error::MissingHeartbeatError
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::ChannelsLimitReached => FailureKind::Unavailable,
        lapin::Error::InvalidProtocolVersion(_)
        | lapin::Error::ParsingError(_)
        | lapin::Error::SerialisationError(_) => FailureKind::Protocol,
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => FailureKind::Conflict,
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => FailureKind::NotFound,
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
            | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED) => FailureKind::AccessRefused,
            AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED) => FailureKind::Unavailable,
            AMQPErrorKind::Hard(AMQPHardError::FRAMEERROR)
            | AMQPErrorKind::Hard(AMQPHardError::SYNTAXERROR)
            | AMQPErrorKind::Hard(AMQPHardError::COMMANDINVALID)
            | AMQPErrorKind::Hard(AMQPHardError::UNEXPECTEDFRAME) => FailureKind::Protocol,
            _ => FailureKind::Other,
        },
        _ => FailureKind::Other,
    }
}

/// Maps a failure raised while opening a connection.
pub(crate) fn connect_error(err: &lapin::Error) -> AmqpError {
    match failure_kind(err) {
        FailureKind::AccessRefused => AmqpError::AuthenticationError(err.to_string()),
        FailureKind::Protocol => AmqpError::ProtocolViolation(err.to_string()),
        _ => AmqpError::ConnectionError(err.to_string()),
    }
}

/// Maps a failure raised by a declare call on `name`, falling back to `other`.
pub(crate) fn declare_error(
    err: &lapin::Error,
    name: &str,
    other: impl FnOnce() -> AmqpError,
) -> AmqpError {
    match failure_kind(err) {
        FailureKind::Conflict => AmqpError::TopologyConflict(name.to_owned()),
        FailureKind::NotFound => AmqpError::QueueNotFound(name.to_owned()),
        FailureKind::Unavailable => AmqpError::ConnectionError(err.to_string()),
        FailureKind::AccessRefused => AmqpError::AuthenticationError(err.to_string()),
        _ => other(),
    }
}

/// Maps a failure raised while configuring an open channel (qos, consume),
/// falling back to `other`. A dropped connection stays retryable.
pub(crate) fn setup_error(err: &lapin::Error, other: impl FnOnce() -> AmqpError) -> AmqpError {
    match failure_kind(err) {
        FailureKind::Unavailable => AmqpError::ConnectionError(err.to_string()),
        FailureKind::AccessRefused => AmqpError::AuthenticationError(err.to_string()),
        FailureKind::Protocol => AmqpError::ProtocolViolation(err.to_string()),
        _ => other(),
    }
}
