//! Frame broadcast and command server
//!
//! One thread multiplexes both listeners and every client socket with
//! `poll(2)`. The frame role pushes the newest ring frame to all clients at
//! the publish rate; the command role answers one command per connection.

pub mod client;
pub mod command;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::control::CameraControl;
use crate::pipeline::RingBuffer;
use crate::ServerConfig;

use client::{ClientTable, Role, MAX_CLIENTS};
use command::MAX_COMMAND_LEN;

/// Longest the publish tick waits for a first frame
const PEEK_WAIT: Duration = Duration::from_millis(5);
/// Frame clients only ever send noise; this much is read and discarded per event
const DISCARD_LEN: usize = 256;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {role} on {addr}: {source}")]
    Bind {
        role: Role,
        addr: String,
        source: io::Error,
    },

    #[error("server socket setup failed: {0}")]
    Io(#[from] io::Error),
}

/// Live server counters
#[derive(Debug, Default)]
pub struct ServerStats {
    frame_clients: AtomicUsize,
    command_clients: AtomicUsize,
    frames_published: AtomicU64,
    frames_sent: AtomicU64,
    clients_rejected: AtomicU64,
    commands_handled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub frame_clients: usize,
    pub command_clients: usize,
    pub frames_published: u64,
    pub frames_sent: u64,
    pub clients_rejected: u64,
    pub commands_handled: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            frame_clients: self.frame_clients.load(Ordering::Relaxed),
            command_clients: self.command_clients.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            clients_rejected: self.clients_rejected.load(Ordering::Relaxed),
            commands_handled: self.commands_handled.load(Ordering::Relaxed),
        }
    }
}

/// What a poll entry refers to
#[derive(Debug, Clone, Copy)]
enum Token {
    Listener(Role),
    Client { role: Role, idx: usize, id: u64 },
}

pub struct StreamServer {
    frame_listener: TcpListener,
    command_listener: TcpListener,
    frame_clients: ClientTable,
    command_clients: ClientTable,
    ring: Arc<RingBuffer>,
    control: Arc<dyn CameraControl>,
    cancel: CancellationToken,
    publish_interval: Duration,
    poll_interval: Duration,
    write_timeout: Duration,
    last_published: Option<u64>,
    next_client_id: u64,
    stats: Arc<ServerStats>,
}

impl StreamServer {
    /// Bind both listeners. Port 0 picks an ephemeral port, see [`local_addrs`](Self::local_addrs).
    pub fn bind(
        config: &ServerConfig,
        ring: Arc<RingBuffer>,
        control: Arc<dyn CameraControl>,
        cancel: CancellationToken,
    ) -> Result<Self, ServerError> {
        let frame_listener = listen(Role::Frame, &config.bind_address, config.frame_port)?;
        let command_listener = listen(Role::Command, &config.bind_address, config.command_port)?;
        debug!(
            "Telemetry port {} reserved, not served",
            config.telemetry_port
        );

        Ok(Self {
            frame_listener,
            command_listener,
            frame_clients: ClientTable::new(Role::Frame),
            command_clients: ClientTable::new(Role::Command),
            ring,
            control,
            cancel,
            publish_interval: crate::utils::rate_period(config.publish_rate_hz),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            last_published: None,
            next_client_id: 0,
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// (frame, command) listener addresses
    pub fn local_addrs(&self) -> io::Result<(SocketAddr, SocketAddr)> {
        Ok((
            self.frame_listener.local_addr()?,
            self.command_listener.local_addr()?,
        ))
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Run the server loop on its own thread
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("stream-server".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        if let Ok((frame, command)) = self.local_addrs() {
            info!(
                "Serving frames on {} and commands on {} ({:.1} Hz publish)",
                frame,
                command,
                1.0 / self.publish_interval.as_secs_f64()
            );
        }

        let mut last_tick: Option<Instant> = None;
        while !self.cancel.is_cancelled() {
            let due = last_tick.map_or(true, |t| t.elapsed() >= self.publish_interval);
            if due && !self.frame_clients.is_empty() {
                last_tick = Some(Instant::now());
                self.publish_tick();
            }

            let timeout = match last_tick {
                Some(t) => self
                    .publish_interval
                    .saturating_sub(t.elapsed())
                    .min(self.poll_interval),
                None => self.poll_interval,
            };

            let ready = match self.wait_ready(timeout) {
                Ok(ready) => ready,
                Err(e) => {
                    error!("poll failed: {}", e);
                    break;
                }
            };
            for (token, revents) in ready {
                self.service(token, revents);
            }
            self.drop_stalled();
            self.update_gauges();
        }

        self.frame_clients.close_all();
        self.command_clients.close_all();
        self.update_gauges();
        info!("Stream server stopped");
    }

    /// Serialize the newest frame and arm every frame client, unless it was already sent
    fn publish_tick(&mut self) {
        let Some(frame) = self.ring.peek_blocking(PEEK_WAIT) else {
            trace!("No frame to publish yet");
            return;
        };
        if self.last_published == Some(frame.sequence()) {
            trace!("Frame {} already published", frame.sequence());
            return;
        }

        let mut wire = BytesMut::new();
        frame.write_wire(&mut wire);
        let wire = wire.freeze();
        self.last_published = Some(frame.sequence());
        let armed = self.frame_clients.arm_all(&wire);
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camserver_frames_published_total").increment(1);
        trace!("Publishing frame {} to {} clients", frame.sequence(), armed);
    }

    fn wait_ready(&self, timeout: Duration) -> nix::Result<Vec<(Token, PollFlags)>> {
        let capacity = 2 + 2 * MAX_CLIENTS;
        let mut tokens = Vec::with_capacity(capacity);
        let mut fds = Vec::with_capacity(capacity);

        for (role, listener) in [
            (Role::Frame, &self.frame_listener),
            (Role::Command, &self.command_listener),
        ] {
            tokens.push(Token::Listener(role));
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        }

        for table in [&self.frame_clients, &self.command_clients] {
            for (idx, client) in table.iter() {
                let mut events = PollFlags::POLLIN;
                if client.wants_write() {
                    events |= PollFlags::POLLOUT;
                }
                tokens.push(Token::Client {
                    role: table.role(),
                    idx,
                    id: client.id,
                });
                fds.push(PollFd::new(client.stream.as_fd(), events));
            }
        }

        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => return Ok(Vec::new()),
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(tokens
            .into_iter()
            .zip(fds.iter())
            .filter_map(|(token, fd)| {
                fd.revents()
                    .filter(|revents| !revents.is_empty())
                    .map(|revents| (token, revents))
            })
            .collect())
    }

    fn service(&mut self, token: Token, revents: PollFlags) {
        match token {
            Token::Listener(role) => self.accept_clients(role),
            Token::Client {
                role: Role::Frame,
                idx,
                id,
            } => {
                let closing = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                if revents.intersects(closing) {
                    self.discard_input(idx, id);
                }
                if revents.contains(PollFlags::POLLNVAL) {
                    self.drop_client(Role::Frame, idx, "invalid socket");
                    return;
                }
                if revents.contains(PollFlags::POLLOUT) {
                    self.send_frame(idx, id);
                }
            }
            Token::Client {
                role: Role::Command,
                idx,
                id,
            } => {
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                {
                    self.handle_command(idx, id);
                } else if revents.contains(PollFlags::POLLNVAL) {
                    self.drop_client(Role::Command, idx, "invalid socket");
                }
            }
        }
    }

    fn accept_clients(&mut self, role: Role) {
        loop {
            let listener = match role {
                Role::Frame => &self.frame_listener,
                Role::Command => &self.command_listener,
            };
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("{}: accept failed: {}", role, e);
                    return;
                }
            };

            if self.table(role).is_full() {
                self.reject(role, stream, peer);
                continue;
            }
            if let Err(e) = self.prepare_stream(role, &stream) {
                warn!("{}: dropping {}: {}", role, peer, e);
                continue;
            }

            let id = self.next_client_id;
            self.next_client_id += 1;
            let table = self.table(role);
            match table.insert(stream, peer, id) {
                Ok(idx) => info!(
                    "{}: client {} connected in slot {} ({}/{})",
                    role,
                    peer,
                    idx,
                    table.len(),
                    MAX_CLIENTS
                ),
                Err(stream) => self.reject(role, stream, peer),
            }
        }
    }

    fn table(&mut self, role: Role) -> &mut ClientTable {
        match role {
            Role::Frame => &mut self.frame_clients,
            Role::Command => &mut self.command_clients,
        }
    }

    fn reject(&self, role: Role, stream: TcpStream, peer: SocketAddr) {
        warn!(
            "{}: max clients ({}) reached, closing {}",
            role, MAX_CLIENTS, peer
        );
        drop(stream);
        self.stats.clients_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camserver_clients_rejected_total").increment(1);
    }

    /// Frame sockets never block the loop; command sockets block briefly for their single reply
    fn prepare_stream(&self, role: Role, stream: &TcpStream) -> io::Result<()> {
        match role {
            Role::Frame => stream.set_nonblocking(true)?,
            Role::Command => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(self.write_timeout))?;
                stream.set_write_timeout(Some(self.write_timeout))?;
            }
        }
        stream.set_nodelay(true)?;
        Ok(())
    }

    fn discard_input(&mut self, idx: usize, id: u64) {
        let Some(client) = self.frame_clients.get_mut(idx, id) else {
            return;
        };

        let mut buf = [0u8; DISCARD_LEN];
        match client.stream.read(&mut buf) {
            Ok(0) => self.drop_client(Role::Frame, idx, "closed by peer"),
            Ok(n) => debug!("{}: discarded {} bytes from {}", Role::Frame, n, client.peer),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => self.drop_client(Role::Frame, idx, &e.to_string()),
        }
    }

    #[instrument(level = "trace", skip(self))]
    fn send_frame(&mut self, idx: usize, id: u64) {
        let Some(client) = self.frame_clients.get_mut(idx, id) else {
            return;
        };

        match client.flush() {
            Ok(true) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(e) => self.drop_client(Role::Frame, idx, &e.to_string()),
        }
    }

    /// Frame clients that took no bytes for `write_timeout` are cut off
    fn drop_stalled(&mut self) {
        for idx in self.frame_clients.stalled(self.write_timeout) {
            self.drop_client(Role::Frame, idx, "write stalled");
        }
    }

    fn handle_command(&mut self, idx: usize, id: u64) {
        // One command per connection: the client leaves the table now
        if self.command_clients.get_mut(idx, id).is_none() {
            return;
        }
        let Some(mut client) = self.command_clients.remove(idx) else {
            return;
        };

        let mut buf = [0u8; MAX_COMMAND_LEN];
        let n = match client.stream.read(&mut buf) {
            Ok(0) => {
                debug!("{}: {} closed without a command", Role::Command, client.peer);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("{}: read from {} failed: {}", Role::Command, client.peer, e);
                return;
            }
        };

        let raw = String::from_utf8_lossy(&buf[..n]);
        let reply = command::execute(&raw, self.control.as_ref());
        let reply = reply.to_string();
        info!(
            "{}: {} -> {}",
            Role::Command,
            command::clean(&raw),
            reply.trim_end()
        );
        self.stats.commands_handled.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = client.stream.write_all(reply.as_bytes()) {
            warn!("{}: reply to {} failed: {}", Role::Command, client.peer, e);
        }
        // Connection closes when the client drops
    }

    fn drop_client(&mut self, role: Role, idx: usize, reason: &str) {
        if let Some(client) = self.table(role).remove(idx) {
            info!("{}: client {} disconnected ({})", role, client.peer, reason);
        }
    }

    fn update_gauges(&self) {
        self.stats
            .frame_clients
            .store(self.frame_clients.len(), Ordering::Relaxed);
        self.stats
            .command_clients
            .store(self.command_clients.len(), Ordering::Relaxed);
    }
}

fn listen(role: Role, address: &str, port: u16) -> Result<TcpListener, ServerError> {
    let addr = format!("{}:{}", address, port);
    let listener = TcpListener::bind(&addr).map_err(|source| ServerError::Bind {
        role,
        addr: addr.clone(),
        source,
    })?;
    listener.set_nonblocking(true)?;
    info!("{}: listening on {}", role, listener.local_addr()?);
    Ok(listener)
}
