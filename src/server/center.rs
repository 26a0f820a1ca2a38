//! Lottery center server loop: accept, ingest, draw, distribute, shut down.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

use crate::server::handler::{deliver_winners_step, ingest_step};
use crate::server::{
    BetStore, DrawEngine, FileBetStore, LuckyNumber, MemoryBetStore,
    Scheduler, MAX_AGENCIES,
};
use crate::utils::{tcp_bind_with_retry, CancelToken, TallyError};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct CenterConfig {
    /// Accept poll timeout in millisecs.
    pub accept_timeout_ms: u64,

    /// Path to bet log file.
    pub backer_path: String,

    /// Whether to call `fdatasync()` after every stored batch.
    pub logger_sync: bool,

    /// Keep bets in memory only instead of the log file.
    pub in_memory: bool,

    /// Lottery number that wins the draw.
    pub winning_number: u16,
}

impl Default for CenterConfig {
    fn default() -> Self {
        CenterConfig {
            accept_timeout_ms: 1000,
            backer_path: "/tmp/lottery_center.bets.log".into(),
            logger_sync: false,
            in_memory: false,
            winning_number: LuckyNumber::DEFAULT,
        }
    }
}

/// Phase of the server loop.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Phase {
    /// Fewer agencies registered than expected; still accepting.
    Accepting,

    /// All expected agencies registered; waiting on their last batches.
    Servicing,

    /// Draw performed; handing out winners.
    Distributing,

    /// Terminal.
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The lottery center server. Services agency connections one at a time on
/// a single task.
pub struct LotteryCenter {
    /// Number of agencies expected to take part in the draw.
    max_agencies: usize,

    /// Accept poll timeout.
    accept_timeout: Duration,

    /// Listening socket; dropped when the loop ends.
    listener: TcpListener,

    /// Registered agency connections.
    scheduler: Scheduler<TcpStream>,

    /// Bet persistence and winners computation.
    draw: DrawEngine,

    /// Termination flag.
    cancel: CancelToken,

    /// Current loop phase.
    phase: Phase,
}

impl LotteryCenter {
    /// Binds the listening socket and prepares the bet store and win rule
    /// as told by the optional TOML `config_str`.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        backlog: u32,
        max_agencies: u8,
        config_str: Option<&str>,
        cancel: CancelToken,
    ) -> Result<Self, TallyError> {
        let config = parsed_config!(config_str => CenterConfig;
                                    accept_timeout_ms, backer_path,
                                    logger_sync, in_memory, winning_number)?;
        if config.accept_timeout_ms == 0 {
            return logged_err!(
                "invalid config.accept_timeout_ms '{}'",
                config.accept_timeout_ms
            );
        }

        let store: Box<dyn BetStore> = if config.in_memory {
            Box::new(MemoryBetStore::new())
        } else {
            Box::new(
                FileBetStore::new_and_setup(
                    Path::new(&config.backer_path),
                    config.logger_sync,
                )
                .await?,
            )
        };
        let draw =
            DrawEngine::new(store, Box::new(LuckyNumber(config.winning_number)));

        let listener = tcp_bind_with_retry(bind_addr, backlog, 10).await?;
        Self::new_with_parts(
            listener,
            max_agencies,
            Duration::from_millis(config.accept_timeout_ms),
            draw,
            cancel,
        )
    }

    /// Assembles a server around an already bound listener and draw engine.
    pub fn new_with_parts(
        listener: TcpListener,
        max_agencies: u8,
        accept_timeout: Duration,
        draw: DrawEngine,
        cancel: CancelToken,
    ) -> Result<Self, TallyError> {
        if max_agencies == 0 || max_agencies as usize > MAX_AGENCIES {
            return logged_err!("invalid max_agencies {}", max_agencies);
        }
        if accept_timeout.is_zero() {
            return logged_err!("accept timeout must be positive");
        }
        pf_info!(
            "accepting agencies on '{}', expecting {}",
            listener.local_addr()?,
            max_agencies
        );

        Ok(LotteryCenter {
            max_agencies: max_agencies as usize,
            accept_timeout,
            listener,
            scheduler: Scheduler::new(),
            draw,
            cancel,
            phase: Phase::Accepting,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TallyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Current phase of the loop.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            pf_info!("phase {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    /// Phase implied by the current registration count, before the draw.
    fn intake_phase(&self) -> Phase {
        if self.scheduler.len() < self.max_agencies {
            Phase::Accepting
        } else {
            Phase::Servicing
        }
    }

    /// Runs one ingestion step on the agency at `idx`, de-registering it if
    /// the step fails.
    async fn ingest_at(&mut self, idx: usize) {
        let claimed = self.scheduler.claimed_ids(idx);
        let Some(agency) = self.scheduler.agency_mut(idx) else {
            pf_error!("no agency at index {}", idx);
            return;
        };
        if let Err(e) =
            ingest_step(agency, &claimed, &mut self.draw, &self.cancel).await
        {
            let Some(mut agency) = self.scheduler.remove_agency(idx) else {
                return;
            };
            if e.is_cancelled() {
                pf_info!("step on {} interrupted by termination", agency.label());
            } else {
                pf_error!("dropping {}: {}", agency.label(), e);
            }
            let _ = agency.conn.shutdown().await;
        }
    }

    /// One tick of the ACCEPTING phase.
    async fn accept_tick(&mut self) -> Result<(), TallyError> {
        match time::timeout(self.accept_timeout, self.listener.accept()).await
        {
            Ok(Ok((stream, peer))) => {
                pf_info!("accepted connection from {}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    pf_warn!("error setting nodelay for {}: {}", peer, e);
                }
                self.scheduler.add_agency(stream, peer)?;
                // the newcomer sits under the cursor; serve it right away
                if let Some(idx) = self.scheduler.get_next_agency() {
                    self.ingest_at(idx).await;
                }
            }
            Ok(Err(e)) => {
                pf_warn!("error accepting agency connection: {}", e);
            }
            Err(_) => {
                if let Some(idx) = self.scheduler.get_next_agency() {
                    self.ingest_at(idx).await;
                }
            }
        }
        Ok(())
    }

    /// One tick of the SERVICING phase. Returns true once every agency has
    /// its last batch stored.
    async fn servicing_tick(&mut self) -> Result<bool, TallyError> {
        if self.scheduler.all_bets_stored() {
            return Ok(true);
        }
        match self.scheduler.get_next_agency() {
            Some(idx) => {
                self.ingest_at(idx).await;
                Ok(false)
            }
            None => logged_err!(
                "scheduler found nothing pending while {} agencies are incomplete",
                self.scheduler.len()
            ),
        }
    }

    /// Performs the draw and delivers every agency its winners, closing each
    /// connection right after.
    async fn distribute(&mut self) -> Result<(), TallyError> {
        let winners = self.draw.compute_winners().await?;
        for (id, docs) in winners.iter() {
            pf_debug!("agency {} has {} winners", id, docs.len());
        }
        self.scheduler.assign_winners(winners);

        while let Some(mut agency) = self.scheduler.pop_agency() {
            match deliver_winners_step(&mut agency, &self.cancel).await {
                Ok(true) => pf_info!("{} confirmed its winners", agency.label()),
                Ok(false) => {}
                Err(e) if e.is_cancelled() => {
                    pf_info!(
                        "delivery to {} interrupted by termination",
                        agency.label()
                    );
                    let _ = agency.conn.shutdown().await;
                    break;
                }
                Err(e) => {
                    pf_error!("delivery to {} failed: {}", agency.label(), e)
                }
            }
            let _ = agency.conn.shutdown().await;
        }
        Ok(())
    }

    /// Closes every still-registered connection without servicing it.
    async fn teardown(&mut self) {
        let agencies = self.scheduler.drain();
        if !agencies.is_empty() {
            pf_warn!("closing {} agency connections", agencies.len());
        }
        for mut agency in agencies {
            if let Err(e) = agency.conn.shutdown().await {
                pf_debug!("error closing {}: {}", agency.label(), e);
            }
        }
    }

    /// Main event loop. Returns `Ok(true)` once the draw has been performed
    /// and distributed, or `Ok(false)` if termination was requested before
    /// that. Consumes the server; the listener is closed on return.
    pub async fn run(mut self) -> Result<bool, TallyError> {
        let mut drawn = false;
        let mut result = Ok(());

        while self.phase != Phase::Shutdown {
            if self.cancel.is_raised() {
                pf_warn!("server caught termination signal");
                self.enter_phase(Phase::Shutdown);
                break;
            }

            let tick = match self.phase {
                Phase::Accepting => self.accept_tick().await,
                Phase::Servicing => match self.servicing_tick().await {
                    Ok(true) => {
                        self.enter_phase(Phase::Distributing);
                        continue;
                    }
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                },
                Phase::Distributing => {
                    let res = self.distribute().await;
                    drawn = self.draw.drawn();
                    self.enter_phase(Phase::Shutdown);
                    res
                }
                Phase::Shutdown => Ok(()),
            };

            if let Err(e) = tick {
                result = Err(e);
                self.enter_phase(Phase::Shutdown);
            } else if matches!(self.phase, Phase::Accepting | Phase::Servicing)
            {
                let phase = self.intake_phase();
                self.enter_phase(phase);
            }
        }

        self.teardown().await;
        pf_info!("lottery center shut down, draw performed: {}", drawn);
        result.map(|_| drawn)
    }
}

#[cfg(test)]
mod center_tests {
    use super::*;
    use crate::protocol::{
        encode_batch, encode_reply, read_reply, read_winners, write_frame,
        Bet, Document, MsgId, WireError,
    };
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    type CenterHandle = JoinHandle<Result<bool, TallyError>>;

    fn bet(agency: u8, document: Document, number: u16) -> Bet {
        Bet {
            agency,
            first_name: "Martina".into(),
            last_name: "Gimenez".into(),
            document,
            birthdate: "1996-04-08".into(),
            number,
        }
    }

    async fn spawn_center(
        max_agencies: u8,
    ) -> Result<(SocketAddr, watch::Sender<bool>, CenterHandle), TallyError>
    {
        let (tx_term, cancel) = CancelToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let draw = DrawEngine::new(
            Box::new(MemoryBetStore::new()),
            Box::new(LuckyNumber::default()),
        );
        let center = LotteryCenter::new_with_parts(
            listener,
            max_agencies,
            Duration::from_millis(20),
            draw,
            cancel,
        )?;
        assert_eq!(center.phase(), Phase::Accepting);
        let addr = center.local_addr()?;
        Ok((addr, tx_term, tokio::spawn(center.run())))
    }

    /// Sends one batch as an agency would and returns the reply id.
    async fn send_batch(
        conn: &mut TcpStream,
        agency: u8,
        last: bool,
        bets: &[Bet],
        cancel: &CancelToken,
    ) -> Result<MsgId, TallyError> {
        write_frame(conn, &encode_batch(agency, last, bets)?, cancel).await?;
        Ok(read_reply(conn, cancel).await?)
    }

    /// Waits for the winners frame as an agency would and confirms it.
    async fn await_winners(
        mut conn: TcpStream,
        cancel: CancelToken,
    ) -> Result<Vec<Document>, TallyError> {
        let winners = read_winners(&mut conn, &cancel).await?;
        write_frame(&mut conn, &encode_reply(MsgId::Ack)?, &cancel).await?;
        Ok(winners)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn three_agencies_full_draw() -> Result<(), TallyError> {
        let (addr, _tx_term, center) = spawn_center(3).await?;
        let (_tx_agency, cancel) = CancelToken::new();

        let mut conn_a = TcpStream::connect(addr).await?;
        let bets_a = [bet(1, 22, 7574), bet(1, 11, 7574)];
        let reply = send_batch(&mut conn_a, 1, true, &bets_a, &cancel).await?;
        assert_eq!(reply, MsgId::Ack);

        let mut conn_b = TcpStream::connect(addr).await?;
        let bets_b = [bet(2, 33, 1)];
        let reply = send_batch(&mut conn_b, 2, true, &bets_b, &cancel).await?;
        assert_eq!(reply, MsgId::Ack);

        let mut conn_c = TcpStream::connect(addr).await?;
        let bets_c = [bet(3, 44, 7574)];
        let reply = send_batch(&mut conn_c, 3, false, &bets_c, &cancel).await?;
        assert_eq!(reply, MsgId::Ack);
        let reply = send_batch(&mut conn_c, 3, true, &[], &cancel).await?;
        assert_eq!(reply, MsgId::Ack);

        // delivery order is unspecified, so every agency waits on its own
        let winners_a = tokio::spawn(await_winners(conn_a, cancel.clone()));
        let winners_b = tokio::spawn(await_winners(conn_b, cancel.clone()));
        let winners_c = tokio::spawn(await_winners(conn_c, cancel.clone()));
        assert_eq!(winners_a.await.unwrap()?, vec![22, 11]);
        assert!(winners_b.await.unwrap()?.is_empty());
        assert_eq!(winners_c.await.unwrap()?, vec![44]);

        assert!(center.await.unwrap()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broken_agency_isolated() -> Result<(), TallyError> {
        let (addr, _tx_term, center) = spawn_center(2).await?;
        let (_tx_agency, cancel) = CancelToken::new();

        // sends a WINNERS id where a BATCH is expected
        let mut conn_x = TcpStream::connect(addr).await?;
        write_frame(&mut conn_x, &[MsgId::Winners as u8], &cancel).await?;
        assert_eq!(read_reply(&mut conn_x, &cancel).await?, MsgId::Error);
        assert!(read_reply(&mut conn_x, &cancel).await.is_err());

        let mut conn_a = TcpStream::connect(addr).await?;
        let reply =
            send_batch(&mut conn_a, 1, true, &[bet(1, 5, 7574)], &cancel)
                .await?;
        assert_eq!(reply, MsgId::Ack);
        let mut conn_b = TcpStream::connect(addr).await?;
        let reply =
            send_batch(&mut conn_b, 2, true, &[bet(2, 6, 7574)], &cancel)
                .await?;
        assert_eq!(reply, MsgId::Ack);

        let winners_a = tokio::spawn(await_winners(conn_a, cancel.clone()));
        let winners_b = tokio::spawn(await_winners(conn_b, cancel.clone()));
        assert_eq!(winners_a.await.unwrap()?, vec![5]);
        assert_eq!(winners_b.await.unwrap()?, vec![6]);
        assert!(center.await.unwrap()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_agency_id_rejected() -> Result<(), TallyError> {
        let (addr, _tx_term, center) = spawn_center(2).await?;
        let (_tx_agency, cancel) = CancelToken::new();

        let mut conn_a = TcpStream::connect(addr).await?;
        let reply =
            send_batch(&mut conn_a, 1, true, &[bet(1, 5, 7574)], &cancel)
                .await?;
        assert_eq!(reply, MsgId::Ack);

        // second connection claiming the same agency gets turned away
        let mut conn_b = TcpStream::connect(addr).await?;
        let reply =
            send_batch(&mut conn_b, 1, true, &[bet(1, 6, 7574)], &cancel)
                .await?;
        assert_eq!(reply, MsgId::Error);
        assert!(read_reply(&mut conn_b, &cancel).await.is_err());

        let mut conn_c = TcpStream::connect(addr).await?;
        let reply =
            send_batch(&mut conn_c, 2, true, &[bet(2, 7, 7574)], &cancel)
                .await?;
        assert_eq!(reply, MsgId::Ack);

        let winners_a = tokio::spawn(await_winners(conn_a, cancel.clone()));
        let winners_c = tokio::spawn(await_winners(conn_c, cancel.clone()));
        assert_eq!(winners_a.await.unwrap()?, vec![5]);
        assert_eq!(winners_c.await.unwrap()?, vec![7]);
        assert!(center.await.unwrap()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn termination_mid_distribution() -> Result<(), TallyError> {
        let (addr, tx_term, center) = spawn_center(2).await?;
        let (_tx_agency, cancel) = CancelToken::new();

        let mut conn_a = TcpStream::connect(addr).await?;
        let reply =
            send_batch(&mut conn_a, 1, true, &[bet(1, 5, 7574)], &cancel)
                .await?;
        assert_eq!(reply, MsgId::Ack);
        let mut conn_b = TcpStream::connect(addr).await?;
        let reply =
            send_batch(&mut conn_b, 2, true, &[bet(2, 6, 7574)], &cancel)
                .await?;
        assert_eq!(reply, MsgId::Ack);

        // agencies are popped newest first, so B gets its winners first
        assert_eq!(read_winners(&mut conn_b, &cancel).await?, vec![6]);
        tx_term.send(true).unwrap();
        write_frame(&mut conn_b, &encode_reply(MsgId::Ack)?, &cancel).await?;

        // A is closed without ever seeing its winners
        let res = read_winners(&mut conn_a, &cancel).await;
        assert!(matches!(
            res,
            Err(WireError::Framing(_)) | Err(WireError::Connection(_))
        ));
        assert!(read_reply(&mut conn_b, &cancel).await.is_err());
        assert!(center.await.unwrap()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn termination_mid_ingestion() -> Result<(), TallyError> {
        let (addr, tx_term, center) = spawn_center(2).await?;
        let (_tx_agency, cancel) = CancelToken::new();

        let mut conn_a = TcpStream::connect(addr).await?;
        let reply =
            send_batch(&mut conn_a, 1, false, &[bet(1, 7, 7574)], &cancel)
                .await?;
        assert_eq!(reply, MsgId::Ack);

        tx_term.send(true).unwrap();
        // the server may already be gone, so the write itself can fail
        let frame = encode_batch(1, true, &[bet(1, 8, 7574)])?;
        let _ = write_frame(&mut conn_a, &frame, &cancel).await;

        // never acknowledged; the connection just gets closed
        let res = read_reply(&mut conn_a, &cancel).await;
        assert!(matches!(
            res,
            Err(WireError::Framing(_)) | Err(WireError::Connection(_))
        ));
        assert!(!center.await.unwrap()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn termination_while_idle() -> Result<(), TallyError> {
        let (_addr, tx_term, center) = spawn_center(5).await?;
        tx_term.send(true).unwrap();
        assert!(!center.await.unwrap()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn setup_from_config() -> Result<(), TallyError> {
        let bind_addr: SocketAddr = "127.0.0.1:0".parse()?;
        let (_tx_term, cancel) = CancelToken::new();

        let center = LotteryCenter::new_and_setup(
            bind_addr,
            8,
            3,
            Some("in_memory = true\nwinning_number = 12\naccept_timeout_ms = 5"),
            cancel.clone(),
        )
        .await?;
        assert_eq!(center.accept_timeout, Duration::from_millis(5));
        assert_ne!(center.local_addr()?.port(), 0);

        assert!(LotteryCenter::new_and_setup(
            bind_addr,
            8,
            3,
            Some("accept_timeout_ms = 0"),
            cancel.clone(),
        )
        .await
        .is_err());
        assert!(LotteryCenter::new_and_setup(
            bind_addr,
            8,
            3,
            Some("max_agencies = 3"),
            cancel.clone(),
        )
        .await
        .is_err());
        assert!(LotteryCenter::new_and_setup(
            bind_addr,
            8,
            0,
            Some("in_memory = true"),
            cancel,
        )
        .await
        .is_err());
        Ok(())
    }
}
