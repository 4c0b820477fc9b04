//! Simulated swarm: a loopback transport and seeder tasks that serve blocks
//! to the coordinator over channels.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use piecemeal_peer::{
    BlockRequest, ConnId, MemoryPieceStore, NetHandle, PeerAddr, PeerConnection, PeerId, PieceIndex,
    PieceMap, PieceStore, Transport,
};
use rand::{rngs::StdRng, Rng};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Sent from the coordinator to a seeder.
#[derive(Debug, Clone)]
pub enum Message {
    Request(BlockRequest),
    Have(PieceIndex),
}

/// Sent from a seeder to the coordinator.
#[derive(Debug, Clone)]
pub enum Event {
    Bitfield {
        addr: PeerAddr,
        bitfield: Vec<u8>,
    },
    Block {
        addr: PeerAddr,
        piece: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
}

struct Listener {
    peer_id: PeerId,
    ready_at: Instant,
}

/// In-process transport. Connecting to a simulated seeder before it is
/// listening is refused; once open, the handshake is the seeder's peer id.
pub struct LoopbackTransport {
    listeners: HashMap<PeerAddr, Listener>,
    inboxes: HashMap<NetHandle, Vec<u8>>,
    next_handle: u64,
    bytes_sent: u64,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport {
            listeners: HashMap::new(),
            inboxes: HashMap::new(),
            next_handle: 1,
            bytes_sent: 0,
        }
    }

    /// Accept connections to `addr` after `delay`.
    pub fn listen(&mut self, addr: PeerAddr, peer_id: PeerId, delay: Duration) {
        self.listeners.insert(
            addr,
            Listener {
                peer_id,
                ready_at: Instant::now() + delay,
            },
        );
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    async fn connect(&mut self, addr: &PeerAddr) -> Result<NetHandle> {
        let listener = self
            .listeners
            .get(addr)
            .ok_or_else(|| anyhow!("no route to {}", addr))?;
        if Instant::now() < listener.ready_at {
            bail!("connection refused");
        }
        let handle = NetHandle(self.next_handle);
        self.next_handle += 1;
        self.inboxes
            .insert(handle, listener.peer_id.as_ref().to_vec());
        trace!(%addr, ?handle, "loopback connected");
        Ok(handle)
    }

    async fn send(&mut self, handle: NetHandle, bytes: &[u8]) -> Result<usize> {
        if !self.inboxes.contains_key(&handle) {
            bail!("{:?} is closed", handle);
        }
        self.bytes_sent += bytes.len() as u64;
        Ok(bytes.len())
    }

    async fn receive(&mut self, handle: NetHandle, buf: &mut [u8]) -> Result<usize> {
        let inbox = self
            .inboxes
            .get_mut(&handle)
            .ok_or_else(|| anyhow!("{:?} is closed", handle))?;
        let n = inbox.len().min(buf.len());
        buf[..n].copy_from_slice(&inbox[..n]);
        inbox.drain(..n);
        Ok(n)
    }

    async fn disconnect(&mut self, handle: NetHandle) -> Result<()> {
        self.inboxes.remove(&handle);
        Ok(())
    }
}

/// Coordinator's end of a seeder connection.
#[derive(Debug)]
pub struct SimConnection {
    id: ConnId,
    tx: flume::Sender<Message>,
}

impl SimConnection {
    pub fn new(id: ConnId, tx: flume::Sender<Message>) -> Self {
        SimConnection { id, tx }
    }
}

impl PeerConnection for SimConnection {
    fn id(&self) -> ConnId {
        self.id
    }

    fn is_active(&self) -> bool {
        !self.tx.is_disconnected()
    }

    fn send_have(&mut self, piece_index: PieceIndex) -> Result<()> {
        self.tx
            .send(Message::Have(piece_index))
            .map_err(|_| anyhow!("seeder {:?} hung up", self.id))
    }

    fn send_request(&mut self, request: &BlockRequest) -> Result<()> {
        self.tx
            .send(Message::Request(*request))
            .map_err(|_| anyhow!("seeder {:?} hung up", self.id))
    }
}

/// A simulated peer holding some of the payload.
pub struct Seeder {
    pub addr: PeerAddr,
    pub pieces: Vec<PieceIndex>,
    pub corrupt: bool,
    pub store: Arc<MemoryPieceStore>,
    pub rng: StdRng,
}

impl Seeder {
    pub fn bitfield(&self, n_pieces: u32) -> Vec<u8> {
        let mut have_map = PieceMap::with_capacity(n_pieces as usize);
        for piece_index in self.pieces.iter() {
            have_map.set(*piece_index);
        }
        have_map.into()
    }

    /// Announce possession, then serve block requests until the connection
    /// drops or the simulation is cancelled.
    #[tracing::instrument(skip_all, fields(addr = %self.addr, corrupt = self.corrupt))]
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        requests: flume::Receiver<Message>,
        events: flume::Sender<Event>,
    ) -> Result<()> {
        let bitfield = self.bitfield(self.store.piece_count());
        events
            .send_async(Event::Bitfield {
                addr: self.addr.clone(),
                bitfield,
            })
            .await?;
        loop {
            let msg = select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = requests.recv_async() => msg,
            };
            let req = match msg {
                Ok(Message::Request(req)) => req,
                Ok(Message::Have(piece_index)) => {
                    trace!(piece_index, "peer has piece");
                    continue;
                }
                Err(_) => {
                    debug!("connection closed");
                    return Ok(());
                }
            };
            let mut data = self
                .store
                .piece(req.piece)
                .and_then(|piece| piece.block(req.offset, req.length))
                .ok_or_else(|| anyhow!("no block at {:?}", req))?
                .to_vec();
            if self.corrupt {
                self.rng.fill(&mut data[..]);
            }
            sleep(Duration::from_micros(self.rng.gen_range(0..500))).await;
            if events
                .send_async(Event::Block {
                    addr: self.addr.clone(),
                    piece: req.piece,
                    offset: req.offset,
                    data,
                })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
    }
}

/// Assign each seeder a random subset of pieces, making sure every piece
/// is held by at least one honest seeder.
pub fn distribute_pieces(
    rng: &mut StdRng,
    n_pieces: u32,
    n_seeders: usize,
    n_corrupt: usize,
) -> Vec<Vec<PieceIndex>> {
    let n_honest = n_seeders - n_corrupt;
    let mut assigned = vec![vec![]; n_seeders];
    for piece_index in 0..n_pieces {
        let owner = piece_index as usize % n_honest;
        for (seeder, pieces) in assigned.iter_mut().enumerate() {
            if seeder == owner || rng.gen_bool(0.5) {
                pieces.push(piece_index);
            }
        }
    }
    assigned
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn honest_seeders_cover_every_piece() {
        let mut rng = StdRng::seed_from_u64(1);
        let assigned = distribute_pieces(&mut rng, 50, 4, 2);
        assert_eq!(assigned.len(), 4);
        for piece_index in 0..50 {
            assert!(assigned[..2].iter().any(|pieces| pieces.contains(&piece_index)));
        }
    }

    #[tokio::test]
    async fn loopback_refuses_until_listening() {
        let addr = PeerAddr::new("127.0.0.1", 7000);
        let mut transport = LoopbackTransport::new();
        assert!(transport.connect(&addr).await.is_err());

        transport.listen(addr.clone(), PeerId::new([3; 20]), Duration::from_secs(60));
        assert!(transport.connect(&addr).await.is_err());

        transport.listen(addr.clone(), PeerId::new([3; 20]), Duration::ZERO);
        let handle = transport.connect(&addr).await.expect("connect");
        assert_eq!(transport.send(handle, b"hello").await.expect("send"), 5);
        assert_eq!(transport.bytes_sent(), 5);

        let mut buf = [0u8; 32];
        assert_eq!(transport.receive(handle, &mut buf).await.expect("receive"), 20);
        assert_eq!(&buf[..20], &[3; 20]);
        assert_eq!(transport.receive(handle, &mut buf).await.expect("receive"), 0);

        transport.disconnect(handle).await.expect("disconnect");
        assert!(transport.send(handle, b"hello").await.is_err());
    }

    #[tokio::test]
    async fn seeder_serves_requested_blocks() {
        let payload: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        let store = Arc::new(MemoryPieceStore::seeded(&payload, 1024, 256));
        assert_eq!(store.piece_count(), 2);
        let addr = PeerAddr::new("127.0.0.1", 7001);
        let seeder = Seeder {
            addr: addr.clone(),
            pieces: vec![1],
            corrupt: false,
            store,
            rng: StdRng::seed_from_u64(2),
        };
        let (req_tx, req_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let task = tokio::spawn(seeder.run(CancellationToken::new(), req_rx, event_tx));

        let mut conn = SimConnection::new(ConnId(1), req_tx);
        assert!(conn.is_active());
        conn.send_request(&BlockRequest {
            piece: 1,
            offset: 256,
            length: 256,
        })
        .expect("request");

        match event_rx.recv_async().await.expect("bitfield") {
            Event::Bitfield { bitfield, .. } => assert_eq!(bitfield, vec![0x02]),
            other => panic!("unexpected event {:?}", other),
        }
        match event_rx.recv_async().await.expect("block") {
            Event::Block {
                piece,
                offset,
                data,
                ..
            } => {
                assert_eq!((piece, offset), (1, 256));
                assert_eq!(data, payload[1280..1536].to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }

        drop(conn);
        task.await.expect("join").expect("seeder");
    }
}
