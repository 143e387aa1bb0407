//! Gossip engine: owns the membership state and drives the protocol
//!
//! All membership state (member set, rumor buffer, task scheduler, self
//! identity) is mutated from exactly one place, the engine worker task,
//! so the data structures carry no locks. Outbound sends cross the
//! concurrency boundary as messages on an mpsc channel drained by the
//! transport task.

use crate::codec::{self, Parser};
use crate::command::{self, CommandTable};
use crate::config::GossipConfig;
use crate::error::{GossipError, Result};
use crate::member_set::MemberSet;
use crate::node::{Node, NodeId, NodeStatus};
use crate::rumor::RumorBuffer;
use crate::scheduler::{Task, TaskScheduler};
use crate::transport::UdpTransport;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Membership change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// A previously unknown node entered the membership view
    Joined(Node),
    /// A node stopped answering probes
    Suspected(NodeId),
    /// A suspected node refuted the suspicion
    Recovered(NodeId),
    /// A node was declared failed
    Failed(NodeId),
}

/// Control requests from the public handle into the worker
pub(crate) enum Control {
    Join(SocketAddr),
    Snapshot(oneshot::Sender<Vec<Node>>),
}

/// Decentralized membership engine.
///
/// `Gossip` is the public handle: it owns the worker lifecycle and relays
/// control requests. The protocol state itself lives in [`GossipState`] on
/// the worker task.
pub struct Gossip {
    config: GossipConfig,
    node_id: NodeId,
    commands: CommandTable,
    events: broadcast::Sender<MembershipEvent>,
    running: Mutex<Option<Running>>,
}

struct Running {
    control: mpsc::Sender<Control>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
    worker: JoinHandle<()>,
    recv_loop: JoinHandle<()>,
    send_loop: JoinHandle<()>,
}

impl Gossip {
    /// Create a new engine. Fails on invalid tuning parameters or a
    /// duplicate command registration.
    pub fn new(config: GossipConfig) -> Result<Self> {
        config.validate()?;
        let commands = CommandTable::with_protocol_commands()?;
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            config,
            node_id,
            commands,
            events,
            running: Mutex::new(None),
        })
    }

    /// This node's identifier
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Bind the UDP socket and start the protocol worker.
    ///
    /// Returns the bound address. Fails fast if already started.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.running.lock().is_some() {
            return Err(GossipError::AlreadyStarted);
        }

        let transport =
            UdpTransport::bind(self.config.bind_addr, self.config.recv_buffer_size).await?;
        let local_addr = transport.local_addr()?;
        let advertised = self.config.advertise_addr.unwrap_or(local_addr);

        let (inbox_tx, inbox_rx) = mpsc::channel(1024);
        let (outbound_tx, outbound_rx) = mpsc::channel(1024);
        let (control_tx, control_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let self_node = Node::new(self.node_id.clone(), advertised, 0);
        let state = GossipState::new(
            self_node,
            self.config.clone(),
            self.commands.clone(),
            outbound_tx,
            self.events.clone(),
        );

        let (recv_loop, send_loop) = transport.start(inbox_tx, outbound_rx, shutdown_rx.clone());
        let worker = tokio::spawn(run_worker(state, inbox_rx, control_rx, shutdown_rx));

        let mut guard = self.running.lock();
        if guard.is_some() {
            // Lost a start race; tear down what we just spawned.
            let _ = shutdown_tx.send(true);
            return Err(GossipError::AlreadyStarted);
        }
        *guard = Some(Running {
            control: control_tx,
            shutdown: shutdown_tx,
            local_addr,
            worker,
            recv_loop,
            send_loop,
        });

        info!(node_id = %self.node_id, %local_addr, "gossip engine started");
        Ok(local_addr)
    }

    /// Signal the worker and transport to halt and wait for them to finish.
    /// A no-op if the engine is not running.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        let _ = running.shutdown.send(true);
        let _ = running.worker.await;
        let _ = running.recv_loop.await;
        let _ = running.send_loop.await;

        info!(node_id = %self.node_id, "gossip engine stopped");
        Ok(())
    }

    /// The bound listen address, once started
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.local_addr)
            .ok_or(GossipError::NotStarted)
    }

    /// Ping a seed address to join its cluster
    pub fn join(&self, seed: SocketAddr) -> Result<()> {
        self.control(Control::Join(seed))
    }

    /// Snapshot the current member set (self included)
    pub async fn members(&self) -> Result<Vec<Node>> {
        let (tx, rx) = oneshot::channel();
        self.control(Control::Snapshot(tx))?;
        Ok(rx.await?)
    }

    fn control(&self, request: Control) -> Result<()> {
        let guard = self.running.lock();
        let Some(running) = guard.as_ref() else {
            return Err(GossipError::NotStarted);
        };
        running
            .control
            .try_send(request)
            .map_err(|_| GossipError::ChannelClosed)
    }
}

/// The worker loop: single owner of all membership state.
async fn run_worker(
    mut state: GossipState,
    mut inbox: mpsc::Receiver<(Bytes, SocketAddr)>,
    mut control: mpsc::Receiver<Control>,
    mut shutdown: watch::Receiver<bool>,
) {
    for seed in state.config.seeds.clone() {
        if seed != state.self_node.addr {
            state.join(seed);
        }
    }

    let mut probe = tokio::time::interval(state.config.probe_interval);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    probe.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = inbox.recv() => match received {
                Some((data, from)) => state.handle_datagram(&data, from),
                None => break,
            },
            request = control.recv() => match request {
                Some(Control::Join(addr)) => state.join(addr),
                Some(Control::Snapshot(tx)) => {
                    let _ = tx.send(state.snapshot());
                }
                None => break,
            },
            _ = probe.tick() => state.tick(),
        }
    }

    debug!("gossip worker exited");
}

/// Protocol state, confined to the worker task.
pub(crate) struct GossipState {
    self_node: Node,
    members: MemberSet,
    rumors: RumorBuffer,
    scheduler: TaskScheduler,
    config: GossipConfig,
    commands: CommandTable,
    outbound: mpsc::Sender<(SocketAddr, Bytes)>,
    events: broadcast::Sender<MembershipEvent>,
}

impl GossipState {
    pub(crate) fn new(
        self_node: Node,
        config: GossipConfig,
        commands: CommandTable,
        outbound: mpsc::Sender<(SocketAddr, Bytes)>,
        events: broadcast::Sender<MembershipEvent>,
    ) -> Self {
        let mut members = MemberSet::new();
        members.add(self_node.clone());

        Self {
            scheduler: TaskScheduler::new(config.task_timeout),
            self_node,
            members,
            rumors: RumorBuffer::new(),
            config,
            commands,
            outbound,
            events,
        }
    }

    // ==================== Inbound path ====================

    /// Parse one inbound datagram and dispatch its requests.
    pub(crate) fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        if codec::is_error_frame(data) {
            warn!(
                %from,
                reply = %String::from_utf8_lossy(data).trim_end(),
                "peer rejected our request"
            );
            return;
        }

        let (requests, _) = match Parser.parse(data) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(%from, %err, "discarding malformed datagram");
                self.send_to(from, codec::encode_error(&err.to_string()));
                return;
            }
        };

        if requests.is_empty() {
            // A datagram is never continued; a truncated frame is dead.
            debug!(%from, "discarding incomplete datagram");
            return;
        }

        for request in requests {
            let Some(cmd) = self.commands.lookup(request.name) else {
                let name = String::from_utf8_lossy(request.name).into_owned();
                warn!(%from, command = %name, "no matching command");
                self.send_to(from, codec::encode_error(&format!("unknown command '{}'", name)));
                continue;
            };

            if let Err(err) = cmd.run(&request.args, self) {
                warn!(%from, command = cmd.name(), %err, "failed to handle request");
                if err.is_parse() {
                    self.send_to(from, codec::encode_error(&err.to_string()));
                }
            }
        }
    }

    // ==================== Merge path ====================

    /// Merge a batch of facts into the member set and rumor buffer.
    pub(crate) fn merge(&mut self, facts: Vec<Node>) {
        for fact in facts {
            self.merge_one(fact);
        }
    }

    /// Merge a single fact. Returns whether the fact was accepted as new
    /// information.
    fn merge_one(&mut self, fact: Node) -> bool {
        if fact.id == self.self_node.id {
            self.refute(fact);
            return false;
        }

        let prior = self
            .members
            .get(&fact.id)
            .or_else(|| self.rumors.get(&fact.id))
            .map(|n| n.status);

        let Some(winner) = self.members.try_update(fact) else {
            return false;
        };

        let id = winner.id.clone();
        let status = winner.status;
        if !self.rumors.add(winner) {
            return false;
        }

        trace!(node = %id, ?status, "membership fact accepted");
        let event = match (prior, status) {
            (Some(NodeStatus::Alive), NodeStatus::Suspected) => {
                Some(MembershipEvent::Suspected(id))
            }
            (Some(NodeStatus::Suspected), NodeStatus::Alive) => {
                Some(MembershipEvent::Recovered(id))
            }
            (Some(prior), NodeStatus::Failed) if prior.is_reachable() => {
                Some(MembershipEvent::Failed(id))
            }
            (None, status) if status.is_reachable() => {
                let node = self
                    .rumors
                    .get(&id)
                    .expect("fact just staged")
                    .clone();
                Some(MembershipEvent::Joined(node))
            }
            _ => None,
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }

        true
    }

    /// Handle a rumor about ourselves: anything other than ALIVE is
    /// countered by bumping our incarnation and re-announcing, so the
    /// refutation spreads like any other rumor.
    fn refute(&mut self, fact: Node) {
        if fact.status == NodeStatus::Alive {
            return;
        }

        if fact.status == NodeStatus::Suspected && fact.version < self.self_node.version {
            // Our newer fact is already circulating.
            return;
        }

        self.self_node.version = self.self_node.version.max(fact.version) + 1;
        info!(
            claimed = %fact.status,
            version = self.self_node.version,
            "refuting a rumor about this node"
        );

        let alive = self.self_node.clone();
        if let Some(winner) = self.members.try_update(alive) {
            self.rumors.add(winner);
        }
    }

    // ==================== Outbound actions ====================

    /// Send a direct ping
    pub(crate) fn send_ping(&mut self, dest: &Node) {
        let batch = self.build_rumors();
        let bytes = codec::encode_message(command::PING, &self.self_node, None, &batch);
        self.send_to(dest.addr, bytes);
    }

    /// Reply with an ack carrying our current rumor batch
    pub(crate) fn send_ack(&mut self, dest: &Node) {
        let batch = self.build_rumors();
        let bytes = codec::encode_message(command::ACK, &self.self_node, None, &batch);
        self.send_to(dest.addr, bytes);
    }

    /// Ask `relay` to probe `target` on our behalf
    pub(crate) fn send_ping_req(&mut self, relay: &Node, target: &Node) {
        let batch = self.build_rumors();
        let bytes =
            codec::encode_message(command::PING_REQ, &self.self_node, Some(target), &batch);
        self.send_to(relay.addr, bytes);
    }

    /// Register a pending task awaiting a correlated ack
    pub(crate) fn register(&mut self, task: Task) {
        self.scheduler.add(task);
    }

    /// Resolve every task waiting on an ack from `id`
    pub(crate) fn resolve_acked(&mut self, id: &str) {
        for task in self.scheduler.fetch(id) {
            match task {
                Task::PingReqRelay { requester, target } => {
                    trace!(peer = %target, requester = %requester.id, "relaying ack");
                    self.send_ack(&requester);
                }
                // The ack itself is the confirmation; the merged rumor
                // batch has already repaired the member's status.
                Task::Probe { .. } | Task::IndirectProbe { .. } | Task::Suspicion { .. } => {}
            }
        }
    }

    /// Build the piggyback batch for one outbound message: hot rumors
    /// first (stabilizing exhausted ones as a side effect), padded with a
    /// round-robin slice of steady-state members up to the cap.
    pub(crate) fn build_rumors(&mut self) -> Vec<Node> {
        let cluster_size = self.members.len() + self.rumors.len();
        let max_spread =
            (self.config.lambda * (cluster_size.max(1) as f64).ln()).floor() as usize + 1;

        let (mut batch, now_stable) = self
            .rumors
            .fetch(self.config.max_rumors_per_message, max_spread);
        for node in now_stable {
            trace!(node = %node.id, "rumor stabilized into member set");
            self.members.add(node);
        }

        if batch.len() < self.config.max_rumors_per_message {
            let want = self.config.max_rumors_per_message - batch.len();
            let seen: HashSet<NodeId> = batch.iter().map(|n| n.id.clone()).collect();
            for member in self.members.fetch(want) {
                if !seen.contains(&member.id) {
                    batch.push(member);
                }
            }
        }

        batch
    }

    fn send_to(&mut self, addr: SocketAddr, bytes: Bytes) {
        if let Err(err) = self.outbound.try_send((addr, bytes)) {
            warn!(%addr, %err, "dropping outbound message");
        }
    }

    // ==================== Periodic drive ====================

    /// One protocol period: sweep expired tasks, escalate them, then probe
    /// the next member in round-robin order.
    pub(crate) fn tick(&mut self) {
        for task in self.scheduler.timeout_tasks() {
            self.handle_timeout(task);
        }
        self.probe_round();
    }

    fn handle_timeout(&mut self, task: Task) {
        match task {
            Task::Probe { target } => self.indirect_probe(target),
            Task::IndirectProbe { target } => self.suspect(target),
            Task::Suspicion { target } => self.fail(target),
            // The requester runs its own probe timers; nothing to do here.
            Task::PingReqRelay { requester, target } => {
                trace!(peer = %target, requester = %requester.id, "ping-req relay expired");
            }
        }
    }

    fn probe_round(&mut self) {
        if let Some(target) = self.next_probe_target() {
            trace!(peer = %target.id, "probing");
            self.send_ping(&target);
            self.scheduler.add(Task::Probe { target });
        }
    }

    /// Pick the next probe target: the round-robin member cursor first,
    /// falling back to a buffered peer that has not stabilized yet (fresh
    /// joiners live in the rumor buffer before their first promotion).
    fn next_probe_target(&mut self) -> Option<Node> {
        for _ in 0..self.members.len() {
            let member = self.members.fetch(1).pop()?;
            if member.id != self.self_node.id && !self.scheduler.contains(&member.id) {
                return Some(member);
            }
        }

        self.rumors
            .iter()
            .filter(|n| {
                n.status.is_reachable()
                    && n.id != self.self_node.id
                    && !self.scheduler.contains(&n.id)
            })
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Direct probe went unanswered: fan out indirect probes through a few
    /// random peers.
    fn indirect_probe(&mut self, target: Node) {
        if !self.members.contains(&target.id) {
            // Superseded while the probe was in flight.
            return;
        }

        let relays: Vec<Node> = self
            .members
            .iter()
            .filter(|m| m.id != self.self_node.id && m.id != target.id)
            .cloned()
            .choose_multiple(&mut rand::thread_rng(), self.config.indirect_probes);

        if relays.is_empty() {
            self.suspect(target);
            return;
        }

        debug!(peer = %target.id, relays = relays.len(), "probe timed out, trying indirect probes");
        for relay in &relays {
            self.send_ping_req(relay, &target);
        }
        self.scheduler.add(Task::IndirectProbe { target });
    }

    /// Indirect probes went unanswered too: suspect the target and start
    /// the suspicion countdown.
    fn suspect(&mut self, target: Node) {
        let fact = target.clone().with_status(NodeStatus::Suspected);
        if self.merge_one(fact) {
            warn!(peer = %target.id, "node suspected");
            self.scheduler
                .add_with_timeout(Task::Suspicion { target }, self.config.suspicion_timeout);
        }
    }

    /// Suspicion expired without refutation: declare the target failed.
    fn fail(&mut self, target: Node) {
        let fact = target.clone().with_status(NodeStatus::Failed);
        if self.merge_one(fact) {
            warn!(peer = %target.id, "node declared failed");
        }
    }

    // ==================== Bootstrap / introspection ====================

    /// Ping a seed address to announce ourselves and pull its view.
    pub(crate) fn join(&mut self, seed: SocketAddr) {
        info!(%seed, "pinging seed");
        let batch = self.build_rumors();
        let bytes = codec::encode_message(command::PING, &self.self_node, None, &batch);
        self.send_to(seed, bytes);
    }

    pub(crate) fn snapshot(&self) -> Vec<Node> {
        self.members.iter().cloned().collect()
    }
}
