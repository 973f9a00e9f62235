// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod configs;
pub mod connection;
pub mod delivery;
pub mod directory;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod handlers;
pub mod manager;
pub mod queue;
pub mod runner;
pub mod topology;

pub use delivery::Delivery;
pub use errors::AmqpError;
pub use handler::{Handler, HandlerRegistry};
pub use manager::{Manager, Shutdowner};
