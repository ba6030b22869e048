//! Connection state machine, transport, dispatcher and built-in controllers
//! for the packetforge protocol server. Depends on `packetforge-core` for the
//! wire packet type, codec, buffer pool and crypto/compression primitives,
//! and on `packetforge-macros` to generate handler descriptors.
//!
//! `packetforge-macros`' `#[handler]` attribute emits code that names this
//! crate by its package name (`packetforge_net::...`) rather than `crate::`,
//! so the same attribute works unchanged on a handler defined in a
//! downstream crate (`packetforge-demo`'s application handlers) as well as
//! on the built-in controllers defined here. The `extern crate self` below
//! is what makes that path resolve for code compiled as part of this crate.
extern crate self as packetforge_net;

pub mod config;
pub mod connection;
pub mod controllers;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod queue;
pub mod transport;

pub mod prelude {
    pub use crate::config::{
        ConnectionLimiterConfig, DispatcherConfig, ListenerConfig, QueueConfig, ServerConfig,
    };
    pub use crate::connection::{Connection, ConnectionState, EncryptionMode, MetadataValue};
    pub use crate::controllers::builtin_descriptors;
    pub use crate::dispatcher::{Dispatcher, HandlerDescriptor, HandlerFuture, RateLimitSpec};
    pub use crate::listener::Listener;
    pub use crate::queue::{PriorityQueue, QueueStats};
    pub use crate::transport::TransportStream;
}
