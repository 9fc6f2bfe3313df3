use std::{
    collections::{BTreeMap, BTreeSet},
    io::{self, Write},
    net::{SocketAddr, TcpStream},
    ops::Deref,
    time::Duration,
};

use jobprotocol::{
    FrameError, FramedBuffer, JobPid, Newline, ReadStatus, Reply,
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

/// Bytes a client may have queued but not yet accepted before it is
/// considered too slow and dropped.
pub const MAX_OUTBOX: usize = 256 * 1024;

#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        ConnectionId(value)
    }
}

impl Deref for ConnectionId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Snafu)]
pub enum AdmitError {
    #[snafu(display("connection limit of {max_clients} reached"))]
    Full { max_clients: usize },
    #[snafu(display("could not configure the client socket: {source}"))]
    Setup { source: io::Error },
}

/// What one read from a client produced.
#[derive(Debug)]
pub enum ClientRead {
    Frames(Vec<Vec<u8>>),
    Closed,
}

#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: FramedBuffer,
    // bytes the socket has not accepted yet
    outbox: Vec<u8>,
    watching: BTreeSet<JobPid>,
    broken: bool,
}

impl Client {
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    #[must_use]
    pub fn watching(&self) -> &BTreeSet<JobPid> {
        &self.watching
    }

    /// There is queued output waiting for the socket to become writable.
    #[must_use]
    pub fn wants_write(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// A write failed or the client fell too far behind. It gets dropped at
    /// the end of the current loop iteration.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn buffer_mut(&mut self) -> &mut FramedBuffer {
        &mut self.buffer
    }

    /// Reads once and drains every complete command.
    pub fn read_frames(&mut self) -> Result<ClientRead, FrameError> {
        if self.buffer.read_from(&mut self.stream)? == ReadStatus::Closed {
            return Ok(ClientRead::Closed);
        }
        let mut frames = Vec::new();
        while let Some(frame) = self.buffer.take_frame() {
            frames.push(frame);
        }
        Ok(ClientRead::Frames(frames))
    }

    /// Queues `bytes` and writes as much as the socket takes right now.
    pub fn send(&mut self, bytes: &[u8]) {
        if self.broken {
            return;
        }
        if self.outbox.len() + bytes.len() > MAX_OUTBOX {
            warn!("client {} is not reading, dropping it", self.peer);
            self.broken = true;
            return;
        }
        self.outbox.extend_from_slice(bytes);
        self.flush();
    }

    /// Writes queued bytes until the socket would block.
    pub fn flush(&mut self) {
        while !self.outbox.is_empty() && !self.broken {
            match self.stream.write(&self.outbox) {
                Ok(0) => self.broken = true,
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("write to {} failed: {e}", self.peer);
                    self.broken = true;
                }
            }
        }
    }

    /// Last chance delivery before the socket is closed: blocks for at most
    /// `timeout` per write.
    pub fn flush_with_timeout(&mut self, timeout: Duration) {
        if self.broken || self.outbox.is_empty() {
            return;
        }
        let blocking = self
            .stream
            .set_nonblocking(false)
            .and_then(|()| self.stream.set_write_timeout(Some(timeout)));
        match blocking.and_then(|()| self.stream.write_all(&self.outbox)) {
            Ok(()) => self.outbox.clear(),
            Err(e) => debug!("final write to {} failed: {e}", self.peer),
        }
    }
}

/// Every connected client, keyed by an id that is never reused.
#[derive(Debug)]
pub struct ConnectionTable {
    clients: BTreeMap<ConnectionId, Client>,
    max_clients: usize,
    max_line: usize,
    next_id: u64,
}

impl ConnectionTable {
    #[must_use]
    pub fn new(max_clients: usize, max_line: usize) -> Self {
        Self {
            clients: BTreeMap::new(),
            max_clients,
            max_line,
            next_id: 0,
        }
    }

    /// Registers a freshly accepted stream. When the table is full the
    /// client is told so (best effort) and the stream is closed.
    pub fn admit(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<ConnectionId, AdmitError> {
        if self.clients.len() >= self.max_clients {
            if let Err(e) = stream.write(&Reply::ServerFull.into_bytes()) {
                debug!("could not tell {peer} the server is full: {e}");
            }
            return FullSnafu {
                max_clients: self.max_clients,
            }
            .fail();
        }
        stream.set_nonblocking(true).context(SetupSnafu)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not disable nagle for {peer}: {e}");
        }

        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.clients.insert(
            id,
            Client {
                stream,
                peer,
                buffer: FramedBuffer::new(self.max_line, Newline::Network),
                outbox: Vec::new(),
                watching: BTreeSet::new(),
                broken: false,
            },
        );
        Ok(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn buffer_of(&mut self, id: ConnectionId) -> Option<&mut FramedBuffer> {
        self.clients.get_mut(&id).map(Client::buffer_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &Client)> {
        self.clients.iter().map(|(id, client)| (*id, client))
    }

    /// Records that `id` watches `pid`. False if the client is unknown.
    pub fn watch(&mut self, id: ConnectionId, pid: JobPid) -> bool {
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };
        client.watching.insert(pid);
        true
    }

    pub fn unwatch(&mut self, id: ConnectionId, pid: JobPid) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.watching.remove(&pid);
        }
    }

    /// Forgets every subscription of `id` and returns them.
    pub fn unwatch_all(&mut self, id: ConnectionId) -> BTreeSet<JobPid> {
        self.clients
            .get_mut(&id)
            .map(|client| std::mem::take(&mut client.watching))
            .unwrap_or_default()
    }

    /// Removes the client. Its socket closes when the returned value drops.
    pub fn drop_connection(&mut self, id: ConnectionId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn send(&mut self, id: ConnectionId, bytes: &[u8]) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.send(bytes);
        }
    }

    pub fn flush(&mut self, id: ConnectionId) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.flush();
        }
    }

    pub fn broadcast_all(&mut self, bytes: &[u8]) {
        for client in self.clients.values_mut() {
            client.send(bytes);
        }
    }

    #[must_use]
    pub fn broken(&self) -> Vec<ConnectionId> {
        self.clients
            .iter()
            .filter(|(_, client)| client.broken)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Empties the table, handing every client to the caller.
    pub fn drain(&mut self) -> impl Iterator<Item = (ConnectionId, Client)> {
        std::mem::take(&mut self.clients).into_iter()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader},
        net::TcpListener,
    };

    use super::*;

    /// Connects to a throwaway listener and returns (client side, server
    /// side, peer address of the client).
    fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client =
            TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (client, server, peer)
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut table = ConnectionTable::new(4, 64);
        let (_c1, s1, p1) = socket_pair();
        let (_c2, s2, p2) = socket_pair();
        let a = table.admit(s1, p1).unwrap();
        assert!(table.drop_connection(a).is_some());
        let b = table.admit(s2, p2).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 1);
        assert!(table.drop_connection(a).is_none());
    }

    #[test]
    fn test_full_table_rejects_with_notice() {
        let mut table = ConnectionTable::new(1, 64);
        let (_c1, s1, p1) = socket_pair();
        let (c2, s2, p2) = socket_pair();
        table.admit(s1, p1).unwrap();
        assert!(matches!(
            table.admit(s2, p2),
            Err(AdmitError::Full { max_clients: 1 })
        ));
        assert_eq!(table.len(), 1);

        let mut reader = BufReader::new(c2);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "Server is full\r\n");
        line.clear();
        assert_eq!(reader.read_line(&mut line).unwrap(), 0);
    }

    #[test]
    fn test_watch_bookkeeping() {
        let mut table = ConnectionTable::new(4, 64);
        let (_c, s, p) = socket_pair();
        let id = table.admit(s, p).unwrap();

        assert!(table.watch(id, JobPid(10)));
        assert!(table.watch(id, JobPid(11)));
        assert!(table.watch(id, JobPid(10)));
        assert!(!table.watch(ConnectionId(99), JobPid(10)));
        table.unwatch(id, JobPid(11));
        let watching = table.get(id).unwrap().watching();
        assert_eq!(watching, &BTreeSet::from([JobPid(10)]));
        assert_eq!(table.unwatch_all(id), BTreeSet::from([JobPid(10)]));
        assert!(table.get(id).unwrap().watching().is_empty());
    }

    #[test]
    fn test_send_reaches_peer() {
        let mut table = ConnectionTable::new(4, 64);
        let (c, s, p) = socket_pair();
        let id = table.admit(s, p).unwrap();
        table.send(id, b"[JOB 1] hi\n");
        table.broadcast_all(b"Shutting down\r\n");
        assert!(table.broken().is_empty());

        let mut reader = BufReader::new(c);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "[JOB 1] hi\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "Shutting down\r\n");
    }

    #[test]
    fn test_buffer_of_holds_partial_commands() {
        let mut table = ConnectionTable::new(4, 16);
        let (_c, s, p) = socket_pair();
        let id = table.admit(s, p).unwrap();

        let buffer = table.buffer_of(id).unwrap();
        assert_eq!(buffer.capacity(), 16);
        assert!(buffer.is_empty());
        buffer.append(b"kill 4").unwrap();
        assert_eq!(buffer.take_frame(), None);

        // the partial command survives until the rest arrives
        let buffer = table.buffer_of(id).unwrap();
        assert_eq!(buffer.len(), 6);
        buffer.append(b"2\r\n").unwrap();
        assert_eq!(buffer.take_frame().unwrap(), b"kill 42");
        assert!(buffer.is_empty());

        assert!(table.buffer_of(ConnectionId(99)).is_none());
        table.drop_connection(id);
        assert!(table.buffer_of(id).is_none());
    }

    #[test]
    fn test_read_frames_and_close() {
        let mut table = ConnectionTable::new(4, 64);
        let (mut c, s, p) = socket_pair();
        let id = table.admit(s, p).unwrap();
        c.write_all(b"jobs\r\nwatch 3\r\n").unwrap();
        drop(c);

        let client = table.get_mut(id).unwrap();
        let mut frames = Vec::new();
        // the data may arrive over several reads
        loop {
            match client.read_frames().unwrap() {
                ClientRead::Frames(f) => frames.extend(f),
                ClientRead::Closed => break,
            }
        }
        assert_eq!(frames, vec![b"jobs".to_vec(), b"watch 3".to_vec()]);
    }
}
