//! Accept loop, per-IP connection limiting and the inactivity housekeeping
//! sweep.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use packetforge_core::buffer_pool::BufferPool;
use parking_lot::Mutex;
use slog::{debug, info, o, warn, Logger};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectionLimiterConfig, ListenerConfig, QueueConfig};
use crate::connection::{Connection, ConnectionIdGenerator};
use crate::dispatcher::{Dispatcher, QueuedPacket};
use crate::error::TransportError;
use crate::queue::PriorityQueue;
use crate::transport::TransportStream;

/// Poll backoff used by a connection's dispatch consumer when the priority
/// queue is momentarily empty — the "poll with backoff" suspension point
/// called out for queue dequeues.
const QUEUE_POLL_BACKOFF: Duration = Duration::from_millis(2);

/// Bounds how many connections may be live from a single remote IP, and
/// periodically sweeps registered connections for inactivity.
pub struct ConnectionLimiter {
    config: ConnectionLimiterConfig,
    per_ip: DashMap<IpAddr, usize>,
    registry: Mutex<HashMap<u32, Arc<Connection>>>,
}

impl ConnectionLimiter {
    pub fn new(config: ConnectionLimiterConfig) -> ConnectionLimiter {
        ConnectionLimiter {
            config,
            per_ip: DashMap::new(),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// `true` if `ip` is still under `max_per_ip` and the slot was reserved.
    fn try_acquire(&self, ip: IpAddr) -> bool {
        if self.config.max_per_ip == 0 {
            return true;
        }
        let mut count = self.per_ip.entry(ip).or_insert(0);
        if *count >= self.config.max_per_ip {
            return false;
        }
        *count += 1;
        true
    }

    fn release(&self, ip: IpAddr) {
        if let Some(mut count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
    }

    fn register(&self, connection: Arc<Connection>) {
        self.registry.lock().insert(connection.id(), connection);
    }

    fn unregister(&self, id: u32) {
        self.registry.lock().remove(&id);
    }

    /// Disconnects every registered connection whose transport has been idle
    /// longer than `inactivity_threshold_s`.
    fn sweep(&self, logger: &Logger) {
        let threshold_micros = self.config.inactivity_threshold_s.saturating_mul(1_000_000);
        let now = packetforge_core::packet::now_micros();
        let stale: Vec<Arc<Connection>> = self
            .registry
            .lock()
            .values()
            .filter(|conn| now.saturating_sub(conn.last_activity_micros()) > threshold_micros)
            .cloned()
            .collect();

        for conn in stale {
            debug!(logger, "closing idle connection"; "conn" => conn.id(), "remote" => %conn.remote());
            conn.fire_on_closed();
        }
    }
}

/// Binds a listening socket, accepts connections, applies the per-IP limit
/// and runs a background housekeeping task until cancelled.
pub struct Listener {
    listener: TcpListener,
    config: ListenerConfig,
    queue_config: QueueConfig,
    limiter: Arc<ConnectionLimiter>,
    pool: BufferPool,
    dispatcher: Arc<Dispatcher>,
    ids: ConnectionIdGenerator,
    logger: Logger,
    cancellation: CancellationToken,
    dedup_cache_capacity: usize,
}

impl Listener {
    pub async fn bind(
        config: ListenerConfig,
        limiter_config: ConnectionLimiterConfig,
        queue_config: QueueConfig,
        pool: BufferPool,
        dispatcher: Arc<Dispatcher>,
        logger: Logger,
    ) -> std::io::Result<Listener> {
        let listener = TcpListener::bind(&config.endpoint).await?;
        info!(logger, "listening"; "endpoint" => &config.endpoint);

        Ok(Listener {
            listener,
            queue_config,
            limiter: Arc::new(ConnectionLimiter::new(limiter_config)),
            pool,
            dispatcher,
            ids: ConnectionIdGenerator::default(),
            logger: logger.new(o!("component" => "listener")),
            cancellation: CancellationToken::new(),
            dedup_cache_capacity: 256,
            config,
        })
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Runs the accept loop and the housekeeping sweep concurrently until
    /// `cancellation` fires. Each accepted socket gets its own task; a
    /// connection task exits on read error, explicit disconnect or
    /// cancellation, whichever happens first.
    pub async fn serve(self: Arc<Self>) {
        let housekeeping = tokio::spawn(self.clone().housekeeping_loop());
        self.accept_loop().await;
        housekeeping.abort();
    }

    async fn housekeeping_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.limiter.config.cleanup_interval_s.max(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => return,
                _ = ticker.tick() => self.limiter.sweep(&self.logger),
            }
        }
    }

    async fn accept_loop(self: &Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    info!(self.logger, "accept loop shutting down");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, remote)) => self.handle_accepted(socket, remote),
                        Err(err) => {
                            warn!(self.logger, "accept failed"; "error" => %err);
                            tokio::time::sleep(Duration::from_millis(75)).await;
                        }
                    }
                }
            }
        }
    }

    fn handle_accepted(self: &Arc<Self>, socket: TcpStream, remote: std::net::SocketAddr) {
        if self.config.tcp_nodelay {
            let _ = socket.set_nodelay(true);
        }
        if self.config.keepalive {
            let _ = socket2::SockRef::from(&socket).set_keepalive(true);
        }

        if !self.limiter.try_acquire(remote.ip()) {
            debug!(self.logger, "rejecting connection, per-IP limit exceeded"; "remote" => %remote);
            drop(socket);
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_connection(socket, remote).await;
            this.limiter.release(remote.ip());
        });
    }

    /// Runs one connection's receive loop and its priority-queue dispatch
    /// consumer concurrently: the receive loop only parses frames and
    /// enqueues them (§4.G decouples I/O from handler execution), the
    /// consumer dequeues highest-priority-first and hands packets to the
    /// dispatcher. Control frames never touch the queue — parse failures are
    /// responded to directly from the receive loop. An oversize frame is
    /// dropped and counted rather than disconnecting immediately; the
    /// connection only closes once `Connection::record_frame_violation`
    /// reports a sustained run of them.
    async fn run_connection(self: &Arc<Self>, socket: TcpStream, remote: std::net::SocketAddr) {
        let id = self.ids.next();
        let transport = TransportStream::new(socket, self.pool.clone(), self.dedup_cache_capacity);
        let connection = Connection::new(id, remote, transport);
        self.limiter.register(Arc::clone(&connection));
        debug!(self.logger, "connection accepted"; "conn" => id, "remote" => %remote);

        let validity_check = if self.queue_config.validate_on_dequeue {
            let conn = Arc::clone(&connection);
            Some(Box::new(move |_: &QueuedPacket| conn.state() != crate::connection::ConnectionState::Disconnected)
                as crate::queue::ValidityCheck<QueuedPacket>)
        } else {
            None
        };
        let queue = Arc::new(PriorityQueue::new(self.queue_config.clone(), validity_check));

        let consumer = tokio::spawn(self.clone().dispatch_consumer(Arc::clone(&connection), Arc::clone(&queue)));

        loop {
            tokio::select! {
                _ = connection.cancellation().cancelled() => break,
                frame = connection.transport().recv_frame() => {
                    match frame {
                        Ok(frame) => {
                            connection.reset_frame_violations();
                            match self.dispatcher.parse_frame(&connection, &frame) {
                                Ok(queued) => {
                                    if !queue.enqueue(queued) {
                                        warn!(self.logger, "priority queue full, dropping frame"; "conn" => id);
                                    }
                                    connection.fire_on_packet_ready();
                                }
                                Err(response) => self.dispatcher.send_response(&connection, response).await,
                            }
                        }
                        Err(TransportError::FrameTooLarge) => {
                            warn!(self.logger, "dropping oversize frame"; "conn" => id);
                            if connection.record_frame_violation() {
                                debug!(self.logger, "disconnecting after repeated frame violations"; "conn" => id);
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(self.logger, "connection closed"; "conn" => id, "error" => %err);
                            break;
                        }
                    }
                }
            }
        }

        connection.fire_on_closed();
        consumer.abort();
        self.limiter.unregister(id);
    }

    async fn dispatch_consumer(self: Arc<Self>, connection: Arc<Connection>, queue: Arc<PriorityQueue<QueuedPacket>>) {
        loop {
            tokio::select! {
                _ = connection.cancellation().cancelled() => return,
                _ = async {
                    match queue.dequeue() {
                        Some(queued) => self.dispatcher.dispatch_packet(&connection, queued).await,
                        None => tokio::time::sleep(QUEUE_POLL_BACKOFF).await,
                    }
                } => {}
            }
        }
    }
}
