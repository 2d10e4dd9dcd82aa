use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use bytes::Bytes;

/// Client table capacity per server role
pub const MAX_CLIENTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Frame,
    Command,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Frame => f.write_str("FRAME_SERVER"),
            Role::Command => f.write_str("COMMAND_SERVER"),
        }
    }
}

/// A serialized frame and how much of it already went out
pub(crate) struct Outgoing {
    pub wire: Bytes,
    pub sent: usize,
}

pub(crate) struct Client {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Unique per accepted connection, so a stale readiness event never hits a reused slot
    pub id: u64,
    /// Frame being written
    pub outgoing: Option<Outgoing>,
    /// Newest frame published while `outgoing` was partly written
    pub queued: Option<Bytes>,
    /// Last time the socket took bytes, or a write began
    pub last_progress: Instant,
}

impl Client {
    fn new(stream: TcpStream, peer: SocketAddr, id: u64) -> Self {
        Self {
            stream,
            peer,
            id,
            outgoing: None,
            queued: None,
            last_progress: Instant::now(),
        }
    }

    pub fn wants_write(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Schedule `wire`. A frame already partly written finishes first; one not started is replaced.
    pub fn arm(&mut self, wire: Bytes) {
        match &mut self.outgoing {
            Some(out) if out.sent > 0 => self.queued = Some(wire),
            Some(out) => out.wire = wire,
            None => {
                self.outgoing = Some(Outgoing { wire, sent: 0 });
                self.last_progress = Instant::now();
            }
        }
    }

    /// Write as much as the nonblocking socket takes. `Ok(true)` when a whole frame went out.
    pub fn flush(&mut self) -> io::Result<bool> {
        let Some(out) = self.outgoing.as_mut() else {
            return Ok(false);
        };
        while out.sent < out.wire.len() {
            match self.stream.write(&out.wire[out.sent..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    out.sent += n;
                    self.last_progress = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        self.outgoing = self.queued.take().map(|wire| Outgoing { wire, sent: 0 });
        Ok(true)
    }

    /// A frame is pending and the socket took nothing for `timeout`
    pub fn stalled(&self, timeout: Duration) -> bool {
        self.outgoing.is_some() && self.last_progress.elapsed() >= timeout
    }
}

/// Fixed-size table of connected clients
pub(crate) struct ClientTable {
    role: Role,
    slots: [Option<Client>; MAX_CLIENTS],
}

impl ClientTable {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            slots: Default::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Place a client in the first free slot. Gives the stream back when the table is full.
    pub fn insert(&mut self, stream: TcpStream, peer: SocketAddr, id: u64) -> Result<usize, TcpStream> {
        match self.slots.iter().position(Option::is_none) {
            Some(idx) => {
                self.slots[idx] = Some(Client::new(stream, peer, id));
                Ok(idx)
            }
            None => Err(stream),
        }
    }

    /// Client in `idx`, provided it is still connection `id`
    pub fn get_mut(&mut self, idx: usize, id: u64) -> Option<&mut Client> {
        self.slots
            .get_mut(idx)?
            .as_mut()
            .filter(|client| client.id == id)
    }

    /// Close and forget the client in `idx`
    pub fn remove(&mut self, idx: usize) -> Option<Client> {
        self.slots.get_mut(idx)?.take()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Client)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|c| (idx, c)))
    }

    /// Arm every connected client with `wire`. Returns how many were armed.
    pub fn arm_all(&mut self, wire: &Bytes) -> usize {
        let mut armed = 0;
        for client in self.slots.iter_mut().flatten() {
            client.arm(wire.clone());
            armed += 1;
        }
        armed
    }

    /// Slots whose pending write made no progress for `timeout`
    pub fn stalled(&self, timeout: Duration) -> Vec<usize> {
        self.iter()
            .filter(|(_, client)| client.stalled(timeout))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn close_all(&mut self) {
        for slot in &mut self.slots {
            slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair(listener: &TcpListener) -> (TcpStream, SocketAddr) {
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        listener.accept().unwrap()
    }

    #[test]
    fn test_table_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ClientTable::new(Role::Frame);
        assert!(table.is_empty());

        for id in 0..MAX_CLIENTS as u64 {
            let (stream, peer) = pair(&listener);
            assert_eq!(table.insert(stream, peer, id).ok(), Some(id as usize));
        }
        assert!(table.is_full());
        assert_eq!(table.len(), MAX_CLIENTS);

        let (stream, peer) = pair(&listener);
        assert!(table.insert(stream, peer, 99).is_err());

        // Freed slots are reused, stale ids are not
        table.remove(2);
        let (stream, peer) = pair(&listener);
        assert_eq!(table.insert(stream, peer, 100).ok(), Some(2));
        assert!(table.get_mut(2, 2).is_none());
        assert!(table.get_mut(2, 100).is_some());

        assert_eq!(table.arm_all(&Bytes::from_static(b"frame")), MAX_CLIENTS);
        assert!(table.iter().all(|(_, c)| c.wants_write()));

        table.close_all();
        assert!(table.is_empty());
    }

    #[test]
    fn test_partial_frame_finishes_before_newer_one() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (stream, peer) = pair(&listener);
        let mut client = Client::new(stream, peer, 0);

        client.arm(Bytes::from_static(b"first"));
        // Not started yet, so a newer frame replaces it
        client.arm(Bytes::from_static(b"second"));
        client.outgoing.as_mut().unwrap().sent = 2;
        client.arm(Bytes::from_static(b"third"));

        let out = client.outgoing.as_ref().unwrap();
        assert_eq!(&out.wire[..], b"second");
        assert_eq!(client.queued.as_deref(), Some(&b"third"[..]));
    }

    #[test]
    fn test_unread_client_stalls() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer_side = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        let mut client = Client::new(stream, peer, 0);

        // Far more than the socket buffers hold
        let wire = Bytes::from(vec![0u8; 64 << 20]);
        client.arm(wire.clone());
        assert!(!client.flush().unwrap());
        let sent = client.outgoing.as_ref().unwrap().sent;
        assert!(sent > 0 && sent < wire.len());

        assert!(!client.stalled(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(client.stalled(Duration::from_millis(10)));
        drop(peer_side);
    }
}
