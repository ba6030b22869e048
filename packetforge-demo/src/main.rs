//! Minimal example binary wiring the packet protocol pieces together for
//! manual/integration testing. Not a product CLI: no argument parsing, no
//! daemonization, just enough bootstrap to bind a listener and serve the
//! built-in controllers plus one application-level echo handler.
use std::sync::Arc;

use packetforge_core::buffer_pool::{BufferPool, BufferPoolConfig};
use packetforge_core::packet::{Code, Packet, PacketFlags, PayloadType, PermissionLevel, Priority};
use packetforge_macros::handler;
use packetforge_net::connection::Connection;
use packetforge_net::controllers;
use packetforge_net::dispatcher::Dispatcher;
use packetforge_net::listener::Listener;
use packetforge_net::prelude::ServerConfig;
use slog::{info, o, Logger};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Command id for the demo's own echo handler, well clear of the reserved
/// `0xFF00..=0xFFFF` built-in range.
const ECHO: u16 = 0x0100;

#[handler(id = ECHO, permission = Guest, encryption_required = false)]
async fn echo(packet: Packet, _conn: Arc<Connection>) -> Option<Packet> {
    Some(Packet::new(
        packet.id(),
        Code::SUCCESS,
        packet.number(),
        PayloadType::Binary,
        PacketFlags::NONE,
        Priority::Medium,
        packet.payload().to_vec(),
    ))
}

fn build_logger() -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("logger configuration is always valid here")
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let logger = build_logger().new(o!("service" => "packetforge-demo"));
    let config = ServerConfig::default();

    let pool = BufferPool::new(BufferPoolConfig::default());

    let mut descriptors = controllers::builtin_descriptors();
    descriptors.push(echo_descriptor());

    let dispatcher = Arc::new(
        Dispatcher::new(descriptors, pool.clone(), config.dispatcher.clone(), logger.clone())
            .expect("no two built-in/application handlers share a command id"),
    );

    let listener = Arc::new(
        Listener::bind(
            config.listener.clone(),
            config.connection_limiter.clone(),
            config.queue.clone(),
            pool,
            dispatcher,
            logger.clone(),
        )
        .await?,
    );

    info!(logger, "packetforge demo server starting"; "endpoint" => &config.listener.endpoint);
    listener.serve().await;
    Ok(())
}
