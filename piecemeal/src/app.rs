use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{bail, Error, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use piecemeal_peer::{
    is_protocol_error, BlockOutcome, ConnId, CoordinatorConfig, MemoryPieceStore, Mode, PeerAddr,
    PeerError, PeerId, PieceCoordinator, PieceStatus, PEER_ID_LEN,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tokio::{select, task::JoinSet, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cli::{Commands, SimulateArgs},
    initialize_stdout_logging, initialize_ui_logging,
    sim::{distribute_pieces, Event, LoopbackTransport, Seeder, SimConnection},
    Cli,
};

const LOCALHOST: &str = "127.0.0.1";
const BASE_PORT: u16 = 6881;

/// Invalid pieces a seeder may deliver before it is dropped.
const MAX_STRIKES: u32 = 2;

type SimCoordinator = PieceCoordinator<LoopbackTransport, MemoryPieceStore, SimConnection>;

pub struct App {
    cli: Cli,
    multi_progress: MultiProgress,
}

impl App {
    pub fn new(cli: Cli) -> Result<App> {
        Ok(App {
            cli,
            multi_progress: MultiProgress::new(),
        })
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        self.multi_progress
            .println(format!("🧩 piecemeal {}", env!("CARGO_PKG_VERSION")))?;

        if self.cli.version() {
            return Ok(());
        }

        if self.cli.no_ui() {
            initialize_stdout_logging()
        } else {
            initialize_ui_logging(self.multi_progress.clone());
        }

        let res = match &self.cli.commands {
            Commands::Simulate(args) => self.simulate(args.clone()).await,
            c => Err(Error::msg(format!("unexpected subcommand: {:?}", c))),
        };
        if let Err(e) = res {
            error!(err = e.to_string());
            return Err(e);
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, err)]
    async fn simulate(&self, args: SimulateArgs) -> Result<()> {
        args.validate()?;
        let seed = args.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        info!(seed, pieces = args.pieces, seeders = args.seeders, strategy = %args.strategy, "starting simulation");

        let mut payload = vec![0u8; args.payload_len()];
        rng.fill(&mut payload[..]);
        let payload_digest: [u8; 32] = Sha256::digest(&payload).into();
        info!(payload_digest = hex::encode(payload_digest));

        let seeded = Arc::new(MemoryPieceStore::seeded(
            &payload,
            args.piece_size,
            args.block_size,
        ));
        let mut transport = LoopbackTransport::new();
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Set up ctrl-c handler
        let ctrl_c_cancel = cancel.clone();
        tasks.spawn(async move {
            select! {
                _ = ctrl_c_cancel.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Received ctrl-c, shutting down...");
                    ctrl_c_cancel.cancel();
                }
            }
            Ok::<(), Error>(())
        });

        let assigned = distribute_pieces(&mut rng, args.pieces, args.seeders, args.corrupt_seeders);
        let n_honest = args.seeders - args.corrupt_seeders;
        let mut seeders = vec![];
        for (i, pieces) in assigned.into_iter().enumerate() {
            let addr = PeerAddr::new(LOCALHOST, BASE_PORT + i as u16);
            let mut peer_id = [0u8; PEER_ID_LEN];
            rng.fill(&mut peer_id[..]);
            transport.listen(
                addr.clone(),
                PeerId::new(peer_id),
                Duration::from_millis(rng.gen_range(0..200)),
            );
            seeders.push(Seeder {
                addr,
                pieces,
                corrupt: i >= n_honest,
                store: seeded.clone(),
                rng: StdRng::seed_from_u64(seed.wrapping_add(i as u64 + 1)),
            });
        }

        let config = CoordinatorConfig {
            claim_timeout: args.claim_timeout(),
            strategy: args.strategy,
            ..CoordinatorConfig::default()
        };
        let mut coordinator: SimCoordinator = PieceCoordinator::new(
            config,
            MemoryPieceStore::for_payload(&payload, args.piece_size, args.block_size),
            transport,
        );
        let status_rx = coordinator.subscribe();

        let progress = if self.cli.no_ui() {
            ProgressBar::hidden()
        } else {
            self.multi_progress.add(ProgressBar::new(args.pieces as u64))
        };
        progress.set_style(ProgressStyle::with_template("{msg} {wide_bar} {pos}/{len}")?);
        progress.set_message("Fetching");

        // Connect to each seeder and start serving
        let (event_tx, event_rx) = flume::unbounded();
        for (i, seeder) in seeders.into_iter().enumerate() {
            let addr = match coordinator.add_peer(&seeder.addr.host, seeder.addr.port, None) {
                Some(addr) => addr,
                None => return Err(PeerError::DuplicatePeer(seeder.addr.clone()).into()),
            };
            coordinator.connect_with_backoff(&addr, cancel.clone()).await?;
            coordinator.send(&addr, b"piecemeal").await?;
            let mut handshake = [0u8; PEER_ID_LEN];
            let n = coordinator.receive(&addr, &mut handshake).await?;
            let remote_id = PeerId::try_from(&handshake[..n])?;
            debug!(%addr, peer_id = hex::encode(remote_id), "handshake");

            let (msg_tx, msg_rx) = flume::unbounded();
            coordinator.attach_connection(&addr, SimConnection::new(ConnId(i as u64), msg_tx))?;
            tasks.spawn(seeder.run(cancel.clone(), msg_rx, event_tx.clone()));
        }
        drop(event_tx);

        let mut sim = Simulation {
            coordinator,
            pipeline: args.pipeline,
            in_flight: HashMap::new(),
            strikes: HashMap::new(),
            awaiting_bitfields: args.seeders,
        };
        let res = sim
            .run(&cancel, event_rx, status_rx, &progress, args.claim_timeout())
            .await;

        // Closing the connections ends the seeder tasks
        let addrs: Vec<PeerAddr> = sim.coordinator.registry().addrs().cloned().collect();
        for addr in addrs.iter() {
            sim.coordinator.disconnect(addr).await;
        }
        cancel.cancel();
        for task_res in tasks.join_all().await {
            if let Err(err) = task_res {
                warn!(?err, "simulation task");
            }
        }
        res?;

        let mut digest = Sha256::new();
        for piece_index in 0..args.pieces {
            match sim
                .coordinator
                .store()
                .piece(piece_index)
                .and_then(|piece| piece.contents())
            {
                Some(contents) => digest.update(contents),
                None => bail!("piece {} missing after download", piece_index),
            }
        }
        let fetched_digest: [u8; 32] = digest.finalize().into();
        if fetched_digest != payload_digest {
            bail!("fetched payload digest {} does not match", hex::encode(fetched_digest));
        }
        progress.finish_with_message("Fetch complete");
        info!(
            bytes_sent = sim.coordinator.transport().bytes_sent(),
            "payload verified"
        );
        Ok(())
    }
}

/// The coordinator event loop: every peer event is applied here, one at a
/// time.
struct Simulation {
    coordinator: SimCoordinator,
    pipeline: usize,
    in_flight: HashMap<PeerAddr, usize>,
    strikes: HashMap<PeerAddr, u32>,
    awaiting_bitfields: usize,
}

impl Simulation {
    async fn run(
        &mut self,
        cancel: &CancellationToken,
        event_rx: flume::Receiver<Event>,
        status_rx: flume::Receiver<PieceStatus>,
        progress: &ProgressBar,
        claim_timeout: Duration,
    ) -> Result<()> {
        let mut expire_interval = interval(claim_timeout / 2);
        loop {
            select! {
                _ = cancel.cancelled() => {
                    bail!("simulation cancelled");
                }
                _ = expire_interval.tick() => {
                    for (addr, piece_index) in self.coordinator.expire_stalled_claims() {
                        warn!(%addr, piece_index, "claim stalled");
                    }
                }
                res = event_rx.recv_async() => {
                    match res {
                        Ok(event) => self.apply(event).await,
                        Err(_) => bail!("all seeders have gone"),
                    }
                }
            }

            for status in status_rx.try_iter() {
                match status {
                    PieceStatus::Verified { piece_index, .. } => {
                        debug!(piece_index, "piece verified");
                        progress.inc(1);
                    }
                    PieceStatus::Invalid { piece_index } => {
                        debug!(piece_index, "piece failed validation");
                    }
                }
            }
            if self.coordinator.mode() == Mode::Seeding {
                info!("download complete");
                return Ok(());
            }

            self.fill_pipelines().await;
            if self.awaiting_bitfields == 0
                && self.in_flight.values().sum::<usize>() == 0
                && self.coordinator.selector().claimed_count() == 0
            {
                bail!(
                    "stalled with {} of {} pieces; no connected seeder has the rest",
                    self.coordinator.selector().have_count(),
                    self.coordinator.selector().piece_count()
                );
            }
        }
    }

    async fn apply(&mut self, event: Event) {
        match event {
            Event::Bitfield { addr, bitfield } => {
                self.awaiting_bitfields = self.awaiting_bitfields.saturating_sub(1);
                if let Err(err) = self.coordinator.on_bitfield(&addr, &bitfield).await {
                    self.dropped(&addr, err);
                }
            }
            Event::Block {
                addr,
                piece,
                offset,
                data,
            } => {
                if let Some(n) = self.in_flight.get_mut(&addr) {
                    *n = n.saturating_sub(1);
                }
                match self
                    .coordinator
                    .on_block_received(&addr, piece, offset, &data)
                    .await
                {
                    Ok(BlockOutcome::ValidationFailed) => {
                        let strikes = self.strikes.entry(addr.clone()).or_default();
                        *strikes += 1;
                        if *strikes >= MAX_STRIKES {
                            warn!(%addr, strikes = *strikes, "dropping seeder serving invalid pieces");
                            self.coordinator.disconnect(&addr).await;
                            self.in_flight.remove(&addr);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => self.dropped(&addr, err),
                }
            }
        }
    }

    /// Top up every seeder's in-flight requests to the pipeline depth.
    async fn fill_pipelines(&mut self) {
        if self.coordinator.mode() == Mode::Seeding {
            return;
        }
        let addrs: Vec<PeerAddr> = self.coordinator.registry().addrs().cloned().collect();
        for addr in addrs {
            while self.in_flight.get(&addr).copied().unwrap_or(0) < self.pipeline {
                match self.coordinator.request_next_block(&addr).await {
                    Ok(Some(_)) => *self.in_flight.entry(addr.clone()).or_default() += 1,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%addr, ?err, "requesting block");
                        break;
                    }
                }
            }
        }
    }

    fn dropped(&mut self, addr: &PeerAddr, err: Error) {
        if is_protocol_error(&err) {
            warn!(%addr, %err, "seeder dropped");
        } else {
            warn!(%addr, ?err, "seeder event failed");
        }
        self.in_flight.remove(addr);
    }
}
