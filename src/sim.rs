//! The medium engine: clients, per-AC queues with CSMA/CA, the frame
//! pipeline, the link matrix and the movement job.
//!
//! Everything in here runs on the scheduler thread. Frames are held in
//! an id-keyed arena and referenced by exactly one queue plus their
//! TX-start and TX-complete jobs until the status report is sent, after
//! which they are freed exactly once. Client teardown is deferred to a
//! free list processed at job boundaries so a disconnect observed
//! mid-callback cannot invalidate state the callback still uses.

use std::{
    collections::HashMap,
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixStream,
    },
    path::PathBuf,
};

use log::{debug, info, trace, warn};
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    api::{self, ApiMessage, ApiMsgType, CtlFlags, SetSnrPayload, TxStartPayload},
    config::Config,
    err::{RpcError, SockError},
    hwsim::{
        DelRadioMessage, FrameMessage, HwsimCmd, MacAddrMessage, NewRadioMessage, TxControlFlags,
        TxInfoMessage, TxRate,
    },
    ieee80211::{self, FrameView, MacAddr, NOISE_LEVEL},
    medium::Medium,
    nl::{
        ctrl::Family,
        msg::{GenlMsg, NlMsg},
        sock::{NlSock, RECV_BUF_LEN},
    },
    pcap::PcapSink,
    pmsr::{self, PmsrRequest, PmsrResultPeer, PMSR_STATUS_FAILURE, PMSR_STATUS_SUCCESS},
    rpc::bridge::{RpcOp, RpcReply},
    scheduler::{JobId, Scheduler},
    station::{Registry, Station, StationId, StationInfo},
};

/// Identifies one connected client.
pub type ClientId = usize;

/// Identifies one in-flight frame.
pub type FrameId = u64;

/// Frequency the link matrix is computed at [MHz].
const MATRIX_REF_FREQ_MHZ: u32 = 2412;

/// Reference frame length for the cached per-link error probability.
const MATRIX_REF_FRAME_LEN: usize = 1024;

/// Station movement interval.
const MOVE_INTERVAL_NS: u64 = 3_000_000_000;

/// Frames admitted per `(station, AC)` queue before new ones are
/// rejected with a TX failure.
const MAX_QUEUE_DEPTH: usize = 1000;

/// Transport of one client.
pub enum ClientKind {
    /// The kernel driver behind the daemon's netlink socket.
    Netlink,
    /// A control-protocol connection.
    ApiSock(UnixStream),
}

/// One endpoint the simulator exchanges messages with.
pub struct Client {
    /// Transport handle.
    pub kind: ClientKind,
    /// Subscription flags.
    pub flags: CtlFlags,
    /// Subscribed to frames via `REGISTER`.
    pub wants_frames: bool,
    /// Reads the client's ACK after pushing frames or TX-start
    /// notifications at it; set for registered API clients.
    pub wait_for_ack: bool,
}

/// A pending transmission.
struct Frame {
    src: ClientId,
    sender: StationId,
    sender_hwaddr: MacAddr,
    data: Vec<u8>,
    freq: u32,
    flags: TxControlFlags,
    cookie: u64,
    ac: usize,
    tx_rates: Vec<TxRate>,
    rates_used: Vec<TxRate>,
    acked: bool,
    deliver_rate_idx: usize,
    /// Signal estimate toward the destination [dBm], echoed in the
    /// status report.
    signal: i32,
    dest: Option<StationId>,
    dest_addr: MacAddr,
    tx_start_ns: u64,
    start_job: Option<JobId>,
    complete_job: Option<JobId>,
}

/// The scheduler job vocabulary of the engine.
pub enum Job {
    /// A frame's transmission begins.
    TxStart(FrameId),
    /// A frame's exchange is over: deliver and report status.
    TxComplete(FrameId),
    /// Advance every moving station one tick.
    Move,
    /// Emit a synthesised peer measurement report.
    PmsrReport {
        /// Reporting radio.
        station: StationId,
        /// Results to encode.
        peers: Vec<PmsrResultPeer>,
    },
}

/// The wireless medium simulator.
pub struct Wmediumd {
    scheduler: Scheduler<Job>,
    registry: Registry,
    medium: Medium,
    clients: HashMap<ClientId, Client>,
    clients_to_free: Vec<ClientId>,
    next_client_id: ClientId,
    netlink_client: Option<ClientId>,
    nl: Option<NlSock>,
    family: Option<Family>,
    frames: HashMap<FrameId, Frame>,
    next_frame_id: FrameId,
    snr_matrix: Vec<i32>,
    error_prob_matrix: Vec<f64>,
    matrix_dirty: bool,
    overrides: HashMap<(StationId, StationId), i32>,
    /// Holder and end of the latest transmission window; contention
    /// defers to it only where that transmission is audible.
    medium_busy: Option<(StationId, u64)>,
    move_job: Option<JobId>,
    pmsr_jobs: HashMap<StationId, JobId>,
    pcap: Option<PcapSink>,
    config_path: Option<PathBuf>,
    rng: SmallRng,
}

impl Wmediumd {
    /// Build an engine from a configuration. `seed` pins the RNG for
    /// reproducible runs; [`None`] seeds from the OS.
    pub fn new(config: Config, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let mut sim = Wmediumd {
            scheduler: Scheduler::new(),
            registry: Registry::new(),
            medium: Medium::default(),
            clients: HashMap::new(),
            clients_to_free: Vec::new(),
            next_client_id: 0,
            netlink_client: None,
            nl: None,
            family: None,
            frames: HashMap::new(),
            next_frame_id: 1,
            snr_matrix: Vec::new(),
            error_prob_matrix: Vec::new(),
            matrix_dirty: true,
            overrides: HashMap::new(),
            medium_busy: None,
            move_job: None,
            pmsr_jobs: HashMap::new(),
            pcap: None,
            config_path: None,
            rng,
        };
        sim.apply_config(config);
        sim
    }

    /// Attach the kernel netlink transport; registers the netlink
    /// client slot frames for unowned stations route to.
    pub fn attach_netlink(&mut self, sock: NlSock, family: Family) {
        let id = self.alloc_client(Client {
            kind: ClientKind::Netlink,
            flags: CtlFlags::empty(),
            wants_frames: true,
            wait_for_ack: false,
        });
        self.netlink_client = Some(id);
        self.nl = Some(sock);
        self.family = Some(family);
    }

    /// Numeric hwsim family id, zero until a netlink transport is
    /// attached (API-driven runs and tests encode with zero too).
    pub fn family_id(&self) -> u16 {
        self.family.as_ref().map(|f| f.id).unwrap_or(0)
    }

    /// Raw fd of the netlink socket for the event loop.
    pub fn netlink_fd(&self) -> Option<RawFd> {
        self.nl.as_ref().map(|s| s.as_raw_fd())
    }

    /// Accept a control-protocol client.
    pub fn add_api_client(&mut self, stream: UnixStream) -> ClientId {
        let id = self.alloc_client(Client {
            kind: ClientKind::ApiSock(stream),
            flags: CtlFlags::empty(),
            wants_frames: false,
            wait_for_ack: false,
        });
        info!("api client {id} connected");
        id
    }

    fn alloc_client(&mut self, client: Client) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(id, client);
        id
    }

    /// Raw fd of a client's stream for the event loop.
    pub fn client_fd(&self, id: ClientId) -> Option<RawFd> {
        match self.clients.get(&id)?.kind {
            ClientKind::ApiSock(ref stream) => Some(stream.as_raw_fd()),
            ClientKind::Netlink => None,
        }
    }

    /// Connected API client ids, for event loop registration.
    pub fn api_client_ids(&self) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, c)| matches!(c.kind, ClientKind::ApiSock(_)))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Queue a client for teardown at the next job boundary.
    pub fn schedule_client_free(&mut self, id: ClientId) {
        if !self.clients_to_free.contains(&id) {
            self.clients_to_free.push(id);
        }
    }

    /// Tear down clients queued for removal. Runs at the top of every
    /// scheduler tick, never mid-callback.
    pub fn process_deferred_frees(&mut self) {
        while let Some(id) = self.clients_to_free.pop() {
            if self.clients.remove(&id).is_none() {
                continue;
            }
            info!("client {id} disconnected");
            let owned: Vec<StationId> = self
                .registry
                .iter()
                .filter(|s| s.owner == Some(id))
                .map(|s| s.id)
                .collect();
            for station in owned {
                self.remove_station(station);
            }
            if self.netlink_client == Some(id) {
                self.netlink_client = None;
                self.nl = None;
            }
        }
    }

    /// Current virtual time.
    pub fn now_ns(&self) -> u64 {
        self.scheduler.now_ns()
    }

    /// Due time of the next scheduled job.
    pub fn next_due_ns(&mut self) -> Option<u64> {
        self.scheduler.next_due_ns()
    }

    /// Let virtual time track an external clock.
    pub fn advance_to(&mut self, now_ns: u64) {
        self.scheduler.advance_to(now_ns);
    }

    /// Run every due job up to `limit_ns`.
    pub fn run_due(&mut self, limit_ns: u64) {
        self.process_deferred_frees();
        while let Some((_, job)) = self.scheduler.pop_due(limit_ns) {
            self.run_job(job);
            self.process_deferred_frees();
        }
    }

    /// Run jobs until the scheduler drains, advancing virtual time as
    /// far as the jobs lead. Test harness entry point.
    pub fn run_to_idle(&mut self) {
        self.process_deferred_frees();
        while let Some((_, job)) = self.scheduler.pop_next() {
            self.run_job(job);
            self.process_deferred_frees();
        }
    }

    /// Stations currently known, in insertion order.
    pub fn list_stations(&self) -> Vec<StationInfo> {
        self.registry.iter().map(StationInfo::from).collect()
    }

    // ---- configuration ----

    /// Swap in a parsed configuration: new registry, new medium, new
    /// overrides. Pending frames of the outgoing registry drain with
    /// failure status first.
    pub fn apply_config(&mut self, config: Config) {
        let old: Vec<StationId> = self.registry.ids();
        for id in old {
            self.remove_station(id);
        }

        self.medium = config.medium;
        self.overrides.clear();
        for station_cfg in &config.stations {
            let mut station = Station::new(station_cfg.mac);
            station.x = station_cfg.position.0;
            station.y = station_cfg.position.1;
            station.dir_x = station_cfg.direction.0;
            station.dir_y = station_cfg.direction.1;
            station.tx_power = station_cfg.tx_power;
            station.lci = station_cfg.lci.as_ref().map(|s| s.as_bytes().to_vec());
            station.civicloc = station_cfg.civicloc.as_ref().map(|s| s.as_bytes().to_vec());
            self.registry.insert(station);
        }
        for link in &config.links {
            self.pin_snr(link.node1, link.node2, link.snr);
        }
        self.matrix_dirty = true;
        self.reschedule_move_job();
        info!("configuration applied: {} stations", self.registry.len());
    }

    fn reschedule_move_job(&mut self) {
        if let Some(job) = self.move_job.take() {
            self.scheduler.cancel(job);
        }
        let any_moving = self
            .registry
            .iter()
            .any(|s| s.dir_x != 0.0 || s.dir_y != 0.0);
        if any_moving {
            let due = self.scheduler.now_ns() + MOVE_INTERVAL_NS;
            self.move_job = Some(self.scheduler.schedule(due, Job::Move));
        }
    }

    fn pin_snr(&mut self, a: MacAddr, b: MacAddr, snr: i32) -> bool {
        let (Some(ida), Some(idb)) = (
            self.registry.id_by_any_mac(a),
            self.registry.id_by_any_mac(b),
        ) else {
            return false;
        };
        self.overrides.insert((ida, idb), snr);
        self.overrides.insert((idb, ida), snr);
        true
    }

    // ---- link matrix ----

    fn ensure_matrix(&mut self) {
        if !self.matrix_dirty {
            return;
        }
        let n = self.registry.len();
        self.snr_matrix = vec![0; n * n];
        self.error_prob_matrix = vec![0.0; n * n];
        let ids = self.registry.ids();
        for &tx in &ids {
            for &rx in &ids {
                if tx == rx {
                    continue;
                }
                let (ti, ri, dist, power) = {
                    let t = self.registry.get(tx).expect("station listed");
                    let r = self.registry.get(rx).expect("station listed");
                    (t.index, r.index, t.distance_to(r), t.tx_power)
                };
                let snr = self
                    .medium
                    .link_snr(dist, power, MATRIX_REF_FREQ_MHZ, &mut self.rng);
                self.snr_matrix[ti * n + ri] = snr;
                self.error_prob_matrix[ti * n + ri] = self.medium.per.error_prob(
                    f64::from(snr),
                    0,
                    MATRIX_REF_FREQ_MHZ,
                    MATRIX_REF_FRAME_LEN,
                );
            }
        }
        // A recompute supersedes pinned values for pairs that still
        // exist; they were pinned "until the next recompute".
        self.overrides.clear();
        self.matrix_dirty = false;
        trace!("link matrix recomputed for {n} stations");
    }

    /// Directed link SNR, override first, then the matrix, plus the
    /// per-call fading contribution when enabled.
    fn link_snr(&mut self, tx: StationId, rx: StationId) -> f64 {
        self.ensure_matrix();
        let base = match self.overrides.get(&(tx, rx)) {
            Some(&snr) => f64::from(snr),
            None => {
                let n = self.registry.len();
                let (ti, ri) = match (self.registry.get(tx), self.registry.get(rx)) {
                    (Some(t), Some(r)) => (t.index, r.index),
                    _ => return f64::from(crate::medium::SNR_DEFAULT),
                };
                f64::from(self.snr_matrix[ti * n + ri])
            }
        };
        base + self.medium.fading_signal(&mut self.rng)
    }

    /// Cached reference error probability for a link: rate index 0, a
    /// 1024-byte frame, at the matrix frequency. Unknown stations read
    /// as certain loss.
    pub fn link_error_prob(&mut self, tx: StationId, rx: StationId) -> f64 {
        self.ensure_matrix();
        let n = self.registry.len();
        match (self.registry.get(tx), self.registry.get(rx)) {
            (Some(t), Some(r)) if tx != rx => self.error_prob_matrix[t.index * n + r.index],
            _ => 1.0,
        }
    }

    // ---- ingress ----

    /// Drain one readable event on the kernel netlink socket.
    pub fn handle_netlink_readable(&mut self) {
        let Some(netlink_client) = self.netlink_client else {
            return;
        };
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let len = match self.nl.as_ref().map(|s| s.recv(&mut buf)) {
            Some(Ok(len)) => len,
            Some(Err(e)) => {
                warn!("netlink receive failed: {e}");
                return;
            }
            None => return,
        };
        let family_id = self.family_id();
        let mut work = Vec::new();
        for msg in NlMsg::parse_all(&buf[..len]) {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("discarding unparseable netlink buffer: {e}");
                    break;
                }
            };
            if msg.error_code().is_some() || u32::from(msg.ty) == libc::NLMSG_DONE as u32 {
                continue;
            }
            if msg.ty != family_id {
                continue;
            }
            match GenlMsg::parse(msg.payload) {
                Ok(genl) => work.push((HwsimCmd::from(genl.cmd), genl.attrs.to_vec())),
                Err(e) => warn!("discarding netlink message: {e}"),
            }
        }
        for (cmd, attrs) in work {
            self.dispatch_genl(netlink_client, cmd, &attrs);
        }
    }

    /// Process one hwsim command from any transport.
    pub fn dispatch_genl(&mut self, src: ClientId, cmd: HwsimCmd, attrs: &[u8]) {
        match cmd {
            HwsimCmd::Frame => match FrameMessage::parse(attrs) {
                Ok(frame) => self.handle_frame(src, frame),
                Err(e) => warn!("discarding FRAME: {e}"),
            },
            HwsimCmd::NewRadio => match NewRadioMessage::parse(attrs) {
                Ok(radio) => self.on_new_radio(src, radio),
                Err(e) => warn!("discarding NEW_RADIO: {e}"),
            },
            HwsimCmd::DelRadio => match DelRadioMessage::parse(attrs) {
                Ok(radio) => self.on_del_radio(radio),
                Err(e) => warn!("discarding DEL_RADIO: {e}"),
            },
            HwsimCmd::AddMacAddr => match MacAddrMessage::parse(attrs) {
                Ok(msg) => {
                    if let Some(id) = self.registry.id_by_any_mac(msg.transmitter) {
                        self.registry.add_addr(id, msg.receiver);
                    }
                }
                Err(e) => warn!("discarding ADD_MAC_ADDR: {e}"),
            },
            HwsimCmd::DelMacAddr => match MacAddrMessage::parse(attrs) {
                Ok(msg) => {
                    if let Some(id) = self.registry.id_by_any_mac(msg.transmitter) {
                        self.registry.del_addr(id, msg.receiver);
                    }
                }
                Err(e) => warn!("discarding DEL_MAC_ADDR: {e}"),
            },
            HwsimCmd::StartPmsr => self.on_start_pmsr(attrs),
            HwsimCmd::AbortPmsr => self.on_abort_pmsr(attrs),
            HwsimCmd::Register => debug!("client {src} sent REGISTER over netlink"),
            other => debug!("ignoring hwsim command {other:?}"),
        }
    }

    fn on_new_radio(&mut self, src: ClientId, radio: NewRadioMessage) {
        let Some(perm_addr) = radio.perm_addr else {
            warn!("NEW_RADIO without a permanent address");
            return;
        };
        if self.registry.find_by_any_mac(perm_addr).is_some() {
            debug!("NEW_RADIO for known station {perm_addr}");
            return;
        }
        let mut station = Station::new(perm_addr);
        station.radio_id = radio.radio_id;
        if self.netlink_client != Some(src) {
            station.owner = Some(src);
        }
        info!(
            "new radio {perm_addr} ({})",
            radio.radio_name.as_deref().unwrap_or("unnamed")
        );
        self.registry.insert(station);
        self.matrix_dirty = true;
    }

    fn on_del_radio(&mut self, radio: DelRadioMessage) {
        let id = radio
            .perm_addr
            .and_then(|addr| self.registry.id_by_any_mac(addr))
            .or_else(|| {
                radio.radio_id.and_then(|rid| {
                    self.registry
                        .iter()
                        .find(|s| s.radio_id == Some(rid))
                        .map(|s| s.id)
                })
            });
        match id {
            Some(id) => self.remove_station(id),
            None => debug!("DEL_RADIO for unknown radio"),
        }
    }

    /// Remove a station: cancel its jobs, fail its queued frames, drop
    /// it from the registry and invalidate the matrix.
    pub fn remove_station(&mut self, id: StationId) {
        let Some(station) = self.registry.get(id) else {
            return;
        };
        let hwaddr = station.hwaddr;
        let queued: Vec<FrameId> = station
            .queues
            .iter()
            .flat_map(|q| q.frames.iter().copied())
            .collect();
        for fid in queued {
            if let Some(frame) = self.frames.remove(&fid) {
                if let Some(job) = frame.start_job {
                    self.scheduler.cancel(job);
                }
                if let Some(job) = frame.complete_job {
                    self.scheduler.cancel(job);
                }
                self.send_tx_status(&frame, false);
            }
        }
        if let Some(job) = self.pmsr_jobs.remove(&id) {
            self.scheduler.cancel(job);
        }
        if self.medium_busy.map(|(h, _)| h == id).unwrap_or(false) {
            self.medium_busy = None;
        }
        self.registry.remove(id);
        self.overrides
            .retain(|&(a, b), _| a != id && b != id);
        self.matrix_dirty = true;
        self.reschedule_move_job();
        info!("station {hwaddr} removed");
    }

    // ---- frame pipeline ----

    fn handle_frame(&mut self, src: ClientId, msg: FrameMessage) {
        let sender = match self.registry.find_by_hw(msg.transmitter()) {
            Some(station) => station.id,
            None => {
                warn!(
                    "frame from unregistered transmitter {}, register needed",
                    msg.transmitter()
                );
                self.send_failure_status(src, &msg);
                return;
            }
        };
        let view = FrameView::new(msg.data());
        let ac = view.select_queue() as usize;
        let dest_addr = view.dest().unwrap_or(MacAddr::BROADCAST);
        let dest = if dest_addr.is_multicast() {
            None
        } else {
            self.registry.id_by_any_mac(dest_addr)
        };

        {
            let station = self.registry.get(sender).expect("sender exists");
            if station.queues[ac].frames.len() >= MAX_QUEUE_DEPTH {
                warn!("queue overflow on {} AC {ac}", station.hwaddr);
                self.send_failure_status(src, &msg);
                return;
            }
        }

        let fid = self.next_frame_id;
        self.next_frame_id += 1;
        let frame = Frame {
            src,
            sender,
            sender_hwaddr: msg.transmitter(),
            data: msg.data().clone(),
            freq: msg.freq(),
            flags: msg.flags(),
            cookie: msg.cookie(),
            ac,
            tx_rates: msg.tx_rates().clone(),
            rates_used: Vec::new(),
            acked: false,
            deliver_rate_idx: 0,
            signal: NOISE_LEVEL + crate::medium::SNR_DEFAULT,
            dest,
            dest_addr,
            tx_start_ns: 0,
            start_job: None,
            complete_job: None,
        };
        self.frames.insert(fid, frame);

        let station = self.registry.get_mut(sender).expect("sender exists");
        station.queues[ac].frames.push_back(fid);
        if station.queues[ac].frames.len() == 1 {
            self.start_queue_head(sender, ac);
        }
        trace!("frame {fid} queued on AC {ac}");
    }

    /// Contend for the medium and walk the retry ladder for the frame
    /// at the head of `(station, ac)`, scheduling its TX-start and
    /// TX-complete jobs.
    fn start_queue_head(&mut self, station_id: StationId, ac: usize) {
        self.ensure_matrix();
        let Some(&fid) = self
            .registry
            .get(station_id)
            .and_then(|s| s.queues[ac].frames.front())
        else {
            return;
        };

        let Some(frame) = self.frames.get(&fid) else {
            return;
        };
        let noack =
            frame.dest_addr.is_multicast() || frame.flags.contains(TxControlFlags::NO_ACK);
        let (freq, data_len, dest, tx_rates) =
            (frame.freq, frame.data.len(), frame.dest, frame.tx_rates.clone());

        let timing = ieee80211::band_timing(freq);
        let (cw_start, cw_max, aifsn) = {
            let queue = &self.registry.get(station_id).expect("station exists").queues[ac];
            (queue.cw, queue.cw_max, u64::from(queue.aifsn))
        };
        let aifs_us = ieee80211::aifs(timing, aifsn);

        let dest_snr = dest.map(|d| self.link_snr(station_id, d));

        // Initial contention: AIFS plus a uniform slot draw, counted
        // from when the medium falls idle. A transmission this station
        // cannot hear above the CCA threshold does not defer it.
        let now = self.scheduler.now_ns();
        let idle_from = match self.medium_busy {
            Some((holder, until)) if until > now && holder != station_id => {
                if self.hears_above_cca(station_id, holder) {
                    until
                } else {
                    now
                }
            }
            _ => now,
        };
        let slots = u64::from(self.rng.gen_range(0..=cw_start));
        let contention_us = aifs_us + slots * timing.slot;
        let tx_start_ns = idle_from + contention_us * 1000;

        // Walk the retry ladder. One fresh PER draw per attempt against
        // the unicast destination decides the ACK; the outcome is
        // reused at delivery time so status and delivery agree.
        let mut elapsed_us = 0u64;
        let mut cw = cw_start;
        let mut acked = false;
        let mut deliver_rate_idx = 0usize;
        let mut rates_used = Vec::new();
        let mut first_attempt = true;
        'ladder: for rate in &tx_rates {
            if rate.idx < 0 {
                break;
            }
            let rate_idx = rate.idx as usize;
            let mut used = TxRate {
                idx: rate.idx,
                count: 0,
            };
            let snr = dest_snr.unwrap_or(f64::from(crate::medium::SNR_DEFAULT));
            let per = self
                .medium
                .per
                .error_prob(snr, rate_idx, freq, data_len);
            for _ in 0..rate.count {
                if !first_attempt {
                    let slots = u64::from(self.rng.gen_range(0..=cw));
                    elapsed_us += aifs_us + slots * timing.slot;
                    cw = ((cw << 1) | 1).min(cw_max);
                }
                first_attempt = false;
                used.count += 1;
                deliver_rate_idx = rate_idx;
                elapsed_us += ieee80211::pkt_duration_us(data_len, rate_idx, freq);
                if noack {
                    acked = true;
                    rates_used.push(used);
                    break 'ladder;
                }
                elapsed_us += ieee80211::ack_time_us(freq);
                if self.rng.gen::<f64>() >= per {
                    acked = true;
                    rates_used.push(used);
                    break 'ladder;
                }
            }
            if used.count > 0 {
                rates_used.push(used);
            }
        }
        if rates_used.is_empty() {
            // Empty or exhausted schedule; account one base-rate try.
            rates_used.push(TxRate { idx: 0, count: 1 });
            elapsed_us += ieee80211::pkt_duration_us(data_len, 0, freq);
        }

        let complete_ns = tx_start_ns + elapsed_us.max(1) * 1000;
        if self
            .medium_busy
            .map(|(_, until)| complete_ns > until)
            .unwrap_or(true)
        {
            self.medium_busy = Some((station_id, complete_ns));
        }

        let queue = &mut self.registry.get_mut(station_id).expect("station exists").queues[ac];
        queue.cw = if acked { queue.cw_min } else { cw };

        let start_job = self.scheduler.schedule(tx_start_ns, Job::TxStart(fid));
        let complete_job = self
            .scheduler
            .schedule_with_priority(complete_ns, 1, Job::TxComplete(fid));
        let frame = self.frames.get_mut(&fid).expect("frame exists");
        frame.acked = acked;
        frame.deliver_rate_idx = deliver_rate_idx;
        frame.rates_used = rates_used;
        frame.signal = dest_snr
            .map(|snr| snr as i32 + NOISE_LEVEL)
            .unwrap_or(NOISE_LEVEL + crate::medium::SNR_DEFAULT);
        frame.tx_start_ns = tx_start_ns;
        frame.start_job = Some(start_job);
        frame.complete_job = Some(complete_job);
    }

    /// True when `listener` senses `talker`'s transmission above the
    /// clear channel assessment threshold.
    fn hears_above_cca(&mut self, listener: StationId, talker: StationId) -> bool {
        let snr = self.link_snr(talker, listener);
        snr as i32 + NOISE_LEVEL >= ieee80211::CCA_THRESHOLD
    }

    fn run_job(&mut self, job: Job) {
        match job {
            Job::TxStart(fid) => self.on_tx_start(fid),
            Job::TxComplete(fid) => self.on_tx_complete(fid),
            Job::Move => self.on_move(),
            Job::PmsrReport { station, peers } => self.on_pmsr_report(station, peers),
        }
    }

    fn on_tx_start(&mut self, fid: FrameId) {
        let Some(frame) = self.frames.get_mut(&fid) else {
            return;
        };
        frame.start_job = None;
        let (src, cookie, freq, ts_us, data) = (
            frame.src,
            frame.cookie,
            frame.freq,
            frame.tx_start_ns / 1000,
            frame.data.clone(),
        );
        if let Some(pcap) = &mut self.pcap {
            if let Err(e) = pcap.write(ts_us, &data) {
                warn!("pcap write failed, capture stopped: {e}");
                self.pcap = None;
            }
        }
        let targets: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| {
                matches!(c.kind, ClientKind::ApiSock(_))
                    && c.flags.contains(CtlFlags::NOTIFY_TX_START)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in targets {
            let payload = TxStartPayload {
                cookie: if id == src { cookie } else { 0 },
                freq,
            };
            self.send_api_message(
                id,
                &ApiMessage {
                    ty: ApiMsgType::TxStart,
                    data: payload.encode(),
                },
            );
        }
    }

    fn on_tx_complete(&mut self, fid: FrameId) {
        let Some(mut frame) = self.frames.remove(&fid) else {
            return;
        };
        frame.complete_job = None;
        self.ensure_matrix();

        // Per-receiver delivery. The unicast destination reuses the
        // ladder outcome; group receivers draw independently.
        let mut deliveries: Vec<(StationId, f64)> = Vec::new();
        if frame.dest_addr.is_multicast() {
            let receivers: Vec<StationId> = self
                .registry
                .iter()
                .filter(|s| s.id != frame.sender)
                .map(|s| s.id)
                .collect();
            for rx in receivers {
                let snr = self.link_snr(frame.sender, rx);
                let per = self.medium.per.error_prob(
                    snr,
                    frame.deliver_rate_idx,
                    frame.freq,
                    frame.data.len(),
                );
                if self.rng.gen::<f64>() >= per {
                    deliveries.push((rx, snr));
                }
            }
        } else if let Some(dest) = frame.dest {
            if frame.acked && self.registry.get(dest).is_some() {
                let snr = self.link_snr(frame.sender, dest);
                deliveries.push((dest, snr));
            }
        }

        for (rx, snr) in deliveries {
            self.deliver_frame(&frame, rx, snr);
        }
        self.send_tx_status(&frame, frame.acked);

        // Advance the queue.
        let sender = frame.sender;
        let ac = frame.ac;
        if let Some(station) = self.registry.get_mut(sender) {
            if station.queues[ac].frames.front() == Some(&fid) {
                station.queues[ac].frames.pop_front();
            }
            if !station.queues[ac].frames.is_empty() {
                self.start_queue_head(sender, ac);
            }
        }
    }

    fn deliver_frame(&mut self, frame: &Frame, rx: StationId, snr: f64) {
        let Some(receiver) = self.registry.get(rx) else {
            return;
        };
        let signal = snr as i32 + NOISE_LEVEL;
        let wire = FrameMessage::build_delivery(
            self.family_id(),
            receiver.hwaddr,
            &frame.data,
            frame.deliver_rate_idx as u32,
            signal,
            frame.freq,
        );
        let owner = receiver.owner.or(self.netlink_client);
        let mut targets = Vec::new();
        if let Some(owner) = owner {
            targets.push(owner);
        }
        for (&id, client) in &self.clients {
            if Some(id) != owner
                && (client.flags.contains(CtlFlags::RX_ALL_FRAMES) || client.wants_frames)
                && matches!(client.kind, ClientKind::ApiSock(_))
            {
                targets.push(id);
            }
        }
        for id in targets {
            self.send_netlink_bytes(id, &wire);
        }
    }

    /// Exactly one of these goes back to the frame's source per
    /// accepted frame, after every delivery has been made.
    fn send_tx_status(&mut self, frame: &Frame, acked: bool) {
        let mut flags = frame.flags;
        if acked {
            flags |= TxControlFlags::STAT_ACK;
        }
        let msg = TxInfoMessage {
            transmitter: frame.sender_hwaddr,
            flags,
            signal: frame.signal,
            tx_rates: if frame.rates_used.is_empty() {
                frame.tx_rates.clone()
            } else {
                frame.rates_used.clone()
            },
            cookie: frame.cookie,
        };
        let wire = msg.build(self.family_id());
        self.send_netlink_bytes(frame.src, &wire);
    }

    fn send_failure_status(&mut self, src: ClientId, msg: &FrameMessage) {
        let status = TxInfoMessage {
            transmitter: msg.transmitter(),
            flags: msg.flags(),
            signal: 0,
            tx_rates: msg.tx_rates().clone(),
            cookie: msg.cookie(),
        };
        let wire = status.build(self.family_id());
        self.send_netlink_bytes(src, &wire);
    }

    // ---- egress ----

    fn send_netlink_bytes(&mut self, id: ClientId, wire: &[u8]) {
        let is_netlink = matches!(
            self.clients.get(&id).map(|c| &c.kind),
            Some(ClientKind::Netlink)
        );
        if is_netlink {
            if let Some(nl) = &self.nl {
                if let Err(e) = nl.send(wire) {
                    warn!("netlink send failed: {e}");
                }
            }
        } else if self.clients.contains_key(&id) {
            self.send_api_message(
                id,
                &ApiMessage {
                    ty: ApiMsgType::Netlink,
                    data: wire.to_vec(),
                },
            );
        }
    }

    fn send_api_message(&mut self, id: ClientId, msg: &ApiMessage) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let wait_for_ack = client.wait_for_ack;
        let ClientKind::ApiSock(stream) = &mut client.kind else {
            return;
        };
        if let Err(e) = api::write_message(stream, msg) {
            info!("api client {id} write failed: {e}");
            self.schedule_client_free(id);
            return;
        }
        if wait_for_ack {
            match api::read_message(stream) {
                Ok(ack) if ack.ty == ApiMsgType::Ack => {}
                Ok(other) => warn!("api client {id} answered {:?} instead of ACK", other.ty),
                Err(e) => {
                    info!("api client {id} ack read failed: {e}");
                    self.schedule_client_free(id);
                }
            }
        }
    }

    // ---- control socket ----

    /// Process one message from a control-protocol client. Returns
    /// `false` when the connection is gone and should be unregistered
    /// from the event loop.
    pub fn handle_api_readable(&mut self, id: ClientId) -> bool {
        let msg = {
            let Some(client) = self.clients.get_mut(&id) else {
                return false;
            };
            let ClientKind::ApiSock(stream) = &mut client.kind else {
                return false;
            };
            match api::read_message(stream) {
                Ok(msg) => msg,
                Err(e) => {
                    match e {
                        crate::err::ApiError::Io(ref io)
                            if io.kind() == std::io::ErrorKind::UnexpectedEof => {}
                        ref other => info!("api client {id} read failed: {other}"),
                    }
                    self.schedule_client_free(id);
                    return false;
                }
            }
        };
        self.handle_api_message(id, msg);
        true
    }

    /// Dispatch one already-framed control message, answering with an
    /// ACK. Exposed for the test harness.
    pub fn handle_api_message(&mut self, id: ClientId, msg: ApiMessage) {
        let status = match msg.ty {
            ApiMsgType::Register => {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.wants_frames = true;
                    client.wait_for_ack = true;
                }
                0
            }
            ApiMsgType::Unregister => {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.wants_frames = false;
                    client.wait_for_ack = false;
                }
                0
            }
            ApiMsgType::SetControl => {
                let flags = api::parse_control(&msg.data);
                if let Some(client) = self.clients.get_mut(&id) {
                    client.flags = flags;
                }
                0
            }
            ApiMsgType::Netlink => {
                let mut status = 0;
                let mut work = Vec::new();
                for nlmsg in NlMsg::parse_all(&msg.data) {
                    match nlmsg.and_then(|m| GenlMsg::parse(m.payload)) {
                        Ok(genl) => work.push((HwsimCmd::from(genl.cmd), genl.attrs.to_vec())),
                        Err(e) => {
                            warn!("api client {id}: bad encapsulated netlink: {e}");
                            status = 1;
                        }
                    }
                }
                for (cmd, attrs) in work {
                    self.dispatch_genl(id, cmd, &attrs);
                }
                status
            }
            ApiMsgType::SetSnr => match SetSnrPayload::parse(&msg.data) {
                Ok(payload) => {
                    if self.pin_snr(payload.node1, payload.node2, i32::from(payload.snr)) {
                        0
                    } else {
                        warn!("SET_SNR for unknown stations");
                        2
                    }
                }
                Err(e) => {
                    warn!("bad SET_SNR: {e}");
                    1
                }
            },
            ApiMsgType::ReloadConfig => match api::parse_path(&msg.data) {
                Ok(path) => self.reload_from(Some(PathBuf::from(path))),
                Err(e) => {
                    warn!("bad RELOAD_CONFIG: {e}");
                    1
                }
            },
            ApiMsgType::ReloadCurrentConfig => self.reload_from(None),
            ApiMsgType::GetNodes => {
                let nodes = api::encode_nodes(&self.list_stations());
                self.send_api_message(
                    id,
                    &ApiMessage {
                        ty: ApiMsgType::GetNodes,
                        data: nodes,
                    },
                );
                0
            }
            ApiMsgType::Ack => return, // stray ack, nothing to answer
            other => {
                warn!("api client {id}: unhandled message {other:?}");
                1
            }
        };
        let ack = if status == 0 {
            ApiMessage::ack()
        } else {
            ApiMessage::error_ack(status)
        };
        // The ack closes the exchange; ordering within the connection
        // is preserved because this runs to completion per message.
        if let Some(client) = self.clients.get_mut(&id) {
            if let ClientKind::ApiSock(stream) = &mut client.kind {
                if let Err(e) = api::write_message(stream, &ack) {
                    info!("api client {id} ack write failed: {e}");
                    self.schedule_client_free(id);
                }
            }
        }
    }

    fn reload_from(&mut self, path: Option<PathBuf>) -> u32 {
        let path = match path.or_else(|| self.config_path.clone()) {
            Some(path) => path,
            None => {
                warn!("reload requested but no configuration was ever loaded");
                return 2;
            }
        };
        match Config::load(&path) {
            Ok(config) => {
                self.apply_config(config);
                self.config_path = Some(path);
                0
            }
            Err(e) => {
                warn!("configuration reload failed, keeping previous: {e}");
                2
            }
        }
    }

    // ---- pmsr ----

    fn on_start_pmsr(&mut self, attrs: &[u8]) {
        use crate::hwsim::HwsimAttr;
        use crate::nl::attr::AttrIter;
        let iter = AttrIter::new(attrs);
        let radio = match iter.find(HwsimAttr::AddrTransmitter.into()) {
            Ok(Some(a)) => match a.get_mac() {
                Ok(mac) => mac,
                Err(e) => {
                    warn!("START_PMSR with bad transmitter: {e}");
                    return;
                }
            },
            _ => {
                warn!("START_PMSR without a transmitter");
                return;
            }
        };
        let request = match iter.find(HwsimAttr::PmsrRequest.into()) {
            Ok(Some(a)) => match PmsrRequest::parse(a.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!("discarding unparseable PMSR request: {e}");
                    return;
                }
            },
            _ => {
                warn!("START_PMSR without a request");
                return;
            }
        };
        let Some(initiator) = self.registry.find_by_any_mac(radio).map(|s| s.id) else {
            warn!("START_PMSR from unknown radio {radio}");
            return;
        };

        let mut peers = Vec::with_capacity(request.peers.len());
        for peer in &request.peers {
            let result = match self.registry.find_by_any_mac(peer.addr) {
                Some(target) => {
                    let dist = self
                        .registry
                        .get(initiator)
                        .map(|s| s.distance_to(target))
                        .unwrap_or(0.0);
                    PmsrResultPeer {
                        addr: peer.addr,
                        status: PMSR_STATUS_SUCCESS,
                        rtt_ps: Some(pmsr::rtt_from_distance_ps(dist)),
                        lci: peer.ftm.request_lci.then(|| target.lci.clone()).flatten(),
                        civicloc: peer
                            .ftm
                            .request_civicloc
                            .then(|| target.civicloc.clone())
                            .flatten(),
                    }
                }
                None => PmsrResultPeer {
                    addr: peer.addr,
                    status: PMSR_STATUS_FAILURE,
                    rtt_ps: None,
                    lci: None,
                    civicloc: None,
                },
            };
            peers.push(result);
        }

        // Scheduled rather than sent inline so ABORT_PMSR has a window
        // to cancel it.
        let due = self.scheduler.now_ns();
        let job = self.scheduler.schedule(
            due,
            Job::PmsrReport {
                station: initiator,
                peers,
            },
        );
        if let Some(old) = self.pmsr_jobs.insert(initiator, job) {
            self.scheduler.cancel(old);
        }
    }

    fn on_abort_pmsr(&mut self, attrs: &[u8]) {
        use crate::hwsim::HwsimAttr;
        use crate::nl::attr::AttrIter;
        let radio = AttrIter::new(attrs)
            .find(HwsimAttr::AddrTransmitter.into())
            .ok()
            .flatten()
            .and_then(|a| a.get_mac().ok());
        let Some(radio) = radio else {
            warn!("ABORT_PMSR without a transmitter");
            return;
        };
        if let Some(id) = self.registry.id_by_any_mac(radio) {
            if let Some(job) = self.pmsr_jobs.remove(&id) {
                self.scheduler.cancel(job);
                debug!("aborted pending peer measurement for {radio}");
            }
        }
    }

    fn on_pmsr_report(&mut self, station: StationId, peers: Vec<PmsrResultPeer>) {
        self.pmsr_jobs.remove(&station);
        let Some(radio) = self.registry.get(station) else {
            return;
        };
        let hwaddr = radio.hwaddr;
        let owner = radio.owner.or(self.netlink_client);
        let wire = pmsr::build_report(self.family_id(), hwaddr, self.now_ns(), &peers);
        if let Some(owner) = owner {
            self.send_netlink_bytes(owner, &wire);
        }
    }

    // ---- movement ----

    fn on_move(&mut self) {
        self.move_job = None;
        let mut moved = false;
        let ids = self.registry.ids();
        for id in ids {
            if let Some(station) = self.registry.get_mut(id) {
                if station.dir_x != 0.0 || station.dir_y != 0.0 {
                    station.x += station.dir_x;
                    station.y += station.dir_y;
                    moved = true;
                }
            }
        }
        if moved {
            self.matrix_dirty = true;
        }
        self.reschedule_move_job();
    }

    // ---- rpc ----

    /// Apply one bridged RPC operation. Runs inside the scheduler loop
    /// on the simulator thread.
    pub fn handle_rpc(&mut self, op: RpcOp) -> RpcReply {
        match op {
            RpcOp::SetPosition { mac, x, y } => {
                match self.registry.id_by_any_mac(mac) {
                    Some(id) => {
                        let station = self.registry.get_mut(id).expect("station exists");
                        station.x = x;
                        station.y = y;
                        self.matrix_dirty = true;
                        RpcReply::Ok
                    }
                    None => RpcReply::Err(RpcError::precondition(format!(
                        "unknown station {mac}"
                    ))),
                }
            }
            RpcOp::SetSnr { mac1, mac2, snr } => {
                if self.pin_snr(mac1, mac2, i32::from(snr)) {
                    RpcReply::Ok
                } else {
                    RpcReply::Err(RpcError::precondition("unknown station pair"))
                }
            }
            RpcOp::SetTxPower { mac, dbm } => match self.registry.id_by_any_mac(mac) {
                Some(id) => {
                    self.registry.get_mut(id).expect("station exists").tx_power = dbm;
                    self.matrix_dirty = true;
                    RpcReply::Ok
                }
                None => RpcReply::Err(RpcError::precondition(format!("unknown station {mac}"))),
            },
            RpcOp::SetLci { mac, lci } => match self.registry.id_by_any_mac(mac) {
                Some(id) => {
                    self.registry.get_mut(id).expect("station exists").lci = Some(lci);
                    RpcReply::Ok
                }
                None => RpcReply::Err(RpcError::precondition(format!("unknown station {mac}"))),
            },
            RpcOp::SetCivicloc { mac, civicloc } => match self.registry.id_by_any_mac(mac) {
                Some(id) => {
                    self.registry.get_mut(id).expect("station exists").civicloc = Some(civicloc);
                    RpcReply::Ok
                }
                None => RpcReply::Err(RpcError::precondition(format!("unknown station {mac}"))),
            },
            RpcOp::LoadConfig { path } => match Config::load(&path) {
                Ok(config) => {
                    self.apply_config(config);
                    self.config_path = Some(path);
                    RpcReply::Ok
                }
                Err(e) => RpcReply::Err(RpcError::precondition(e.to_string())),
            },
            RpcOp::ReloadConfig => match self.reload_from(None) {
                0 => RpcReply::Ok,
                _ => RpcReply::Err(RpcError::precondition("configuration reload failed")),
            },
            RpcOp::StartPcap { path } => match PcapSink::open(&path) {
                Ok(sink) => {
                    self.pcap = Some(sink);
                    info!("pcap capture started at {}", path.display());
                    RpcReply::Ok
                }
                Err(e) => RpcReply::Err(RpcError::precondition(e.to_string())),
            },
            RpcOp::StopPcap => {
                self.pcap = None;
                RpcReply::Ok
            }
            RpcOp::ListStations => RpcReply::Stations(self.list_stations()),
        }
    }

    /// Load a configuration file at startup, remembering the path for
    /// later reloads.
    pub fn load_config_path(&mut self, path: PathBuf) -> Result<(), crate::err::ConfigError> {
        let config = Config::load(&path)?;
        self.apply_config(config);
        self.config_path = Some(path);
        Ok(())
    }

    /// Send the hwsim `REGISTER` so the kernel routes frames here.
    pub fn register_with_driver(&self) -> Result<(), SockError> {
        let (Some(nl), Some(family)) = (&self.nl, &self.family) else {
            return Ok(());
        };
        nl.send(&crate::hwsim::build_register(family.id))
    }
}
