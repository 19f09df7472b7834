// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod message;
pub mod monitor;
pub mod publisher;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod supervisor;
pub mod topology;
