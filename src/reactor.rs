//! Acceptor thread, worker threads, remote-host link threads, and the
//! main stage-driving loop.
//!
//! Grounded on `original_source/controller/main.cpp`'s
//! `acceptor_main` / `worker_main` / epoll-wait loop. The legacy
//! integer-tuple ctrl pipe is replaced with a typed `crossbeam-channel`
//! per worker; cross-thread wakeup is folded into each thread's own
//! 200 ms `mio::Poll` timeout rather than a dedicated `ctrl_rev_pipe`,
//! since the stage machine only needs to re-evaluate on a fixed
//! cadence.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use mio::net::{TcpStream, UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};

use crate::channel::{ChannelState, LocalChannel, PollResult};
use crate::engine::{Engine, WorkerCtrl};
use crate::message::{self, MsgType};
use crate::registry::ChannelRegistry;
use crate::remote::RemoteChannel;
use crate::stage::{Stage, StageAction, StageTickInput};
use crate::topology::HostEntry;

const REACTOR_TIMEOUT: Duration = Duration::from_millis(200);

pub fn spawn_workers(engine: Arc<Engine>) -> Vec<Sender<WorkerCtrl>> {
    let mut senders = Vec::with_capacity(engine.config.nthreads);
    for id in 0..engine.config.nthreads {
        let (tx, rx) = unbounded();
        senders.push(tx);
        let engine = engine.clone();
        std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker_loop(id, engine, rx))
            .expect("failed to spawn worker thread");
    }
    senders
}

fn worker_loop(id: usize, engine: Arc<Engine>, ctrl_rx: Receiver<WorkerCtrl>) {
    let mut poll = Poll::new().expect("mio poll init");
    let mut events = Events::with_capacity(256);
    let mut registry: ChannelRegistry<UnixStream> = ChannelRegistry::new();
    let mut next_token = 1usize;

    loop {
        if let Err(e) = poll.poll(&mut events, Some(REACTOR_TIMEOUT)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(worker = id, error = %e, "poll failed");
            continue;
        }

        let mut shutdown = false;
        for ctrl in ctrl_rx.try_iter() {
            match ctrl {
                WorkerCtrl::Shutdown => shutdown = true,
                WorkerCtrl::Connect { self_id, peer_id, mut stream } => {
                    let token = Token(next_token);
                    next_token += 1;
                    // Registered for both interests up front, not just
                    // WRITABLE: the connect-completion edge fires once,
                    // but every PAYLOAD/keepalive this channel will ever
                    // carry arrives after that, and a later reregister
                    // would race the first readable byte.
                    if let Err(e) = poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE) {
                        tracing::error!(worker = id, error = %e, "register connect fd");
                        continue;
                    }
                    let ch = LocalChannel::new(stream, token, self_id, peer_id, ChannelState::ConnInProgress, engine.n_channel.clone());
                    registry.make(token, self_id, peer_id, ch);
                }
                WorkerCtrl::Accept { self_id, peer_id, mut stream } => {
                    let token = Token(next_token);
                    next_token += 1;
                    if let Err(e) = poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE) {
                        tracing::error!(worker = id, error = %e, "register accepted fd");
                        continue;
                    }
                    let ch = LocalChannel::new(stream, token, self_id, peer_id, ChannelState::Accepted, engine.n_channel.clone());
                    registry.make(token, self_id, peer_id, ch);
                }
            }
        }
        if shutdown {
            return;
        }

        let mut to_destroy = Vec::new();
        for event in events.iter() {
            let token = event.token();
            if PollResult::Destroy == LocalChannel::<UnixStream>::pollerr(event) {
                to_destroy.push(token);
                continue;
            }
            let Some(ch) = registry.get_by_token_mut(token) else { continue };

            if event.is_writable() && ch.state() == ChannelState::ConnInProgress {
                if let Err(e) = ch.on_connect_ok() {
                    tracing::error!(worker = id, error = %e, "on_connect_ok failed");
                    to_destroy.push(token);
                    continue;
                }
            }
            if event.is_readable() {
                match ch.pollin() {
                    Ok(msgs) => {
                        for msg in msgs {
                            dispatch_inbound(&engine, ch, msg);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(worker = id, error = %e, "pollin failed");
                        to_destroy.push(token);
                        continue;
                    }
                }
            }
            if event.is_writable() {
                if let Err(e) = ch.pollout() {
                    tracing::warn!(worker = id, error = %e, "pollout failed");
                    to_destroy.push(token);
                }
            }
        }

        for token in to_destroy {
            registry.remove(token);
        }

        for node in engine.topology.local_nodes_for_worker(id, engine.config.nthreads) {
            replay_one(&engine, &mut registry, node);
        }
    }
}

fn dispatch_inbound(engine: &Arc<Engine>, ch: &mut LocalChannel<UnixStream>, msg: message::Message) {
    let hdr = match msg.header() {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "malformed frame on local channel");
            return;
        }
    };
    match hdr.kind() {
        Ok(MsgType::Syn) => {
            let data = msg.data();
            let cli_port = u16::from_le_bytes(
                data[message::HDR_LEN + 8..message::HDR_LEN + 10].try_into().unwrap(),
            );
            if let Err(e) = ch.on_receive_syn(cli_port) {
                tracing::error!(error = %e, "on_receive_syn failed");
            }
        }
        Ok(MsgType::Payload) => {
            let (src_id, dst_id) = message::payload_ids(&msg);
            let now_ns = engine.now_ns();
            let stage = engine.stage.stage();
            engine.stage.record_event(now_ns);

            if engine.topology.is_local(dst_id) {
                // Open Question 1 resolution (DESIGN.md): the drop gate
                // lives here, at the dispatch call site, not inside
                // `ReplayStore::add_msg`. Mirrors `main.cpp`'s two
                // literal break conditions: drop only a round-0 PAYLOAD
                // that arrives while the local stage is TEARDOWN.
                let admit = stage == Stage::Converge
                    || !(engine.stage.iteration_round() == 0 && stage == Stage::Teardown);
                if admit {
                    engine.replay.add_msg(msg, src_id, dst_id, stage, now_ns);
                }
            } else if let Some(remote) = engine.remote_for(dst_id) {
                remote.add_msg(msg);
            } else {
                tracing::warn!(dst_id, "no remote link owns this destination's host");
            }
        }
        Ok(MsgType::SynAck) => {
            tracing::error!("unexpected SYNACK on an established local channel");
        }
        Ok(MsgType::EndOfStage) | Ok(MsgType::KeepBusy) | Ok(MsgType::Ack) => {
            tracing::warn!("unexpected control message on a local channel");
        }
        Err(e) => tracing::error!(error = %e, "unknown wire message type"),
    }
}

fn replay_one<S: Read + Write>(engine: &Arc<Engine>, registry: &mut ChannelRegistry<S>, node: i32) {
    let stage = engine.stage.stage();
    let Some(candidate) = engine.replay.peek_next(node, stage) else { return };
    let Some(ch) = registry.get_mut(node, candidate.src_id) else { return };

    if !matches!(ch.state(), ChannelState::ChannelEstablished | ChannelState::BgpEstablished) {
        return;
    }
    if ch.state() == ChannelState::ChannelEstablished
        && candidate.bgp_type == crate::message::BgpType::Keepalive as u8
    {
        if let Err(e) = ch.on_bgp_established() {
            tracing::error!(error = %e, "on_bgp_established failed during replay");
            return;
        }
    }

    let msg = engine.replay.commit_replay(node, stage);
    if let Err(e) = ch.sendmsg(msg) {
        tracing::error!(error = %e, "sendmsg failed during replay");
    }
}

/// Parses the client-bound Unix path `/ripc/emu-real-<u>/<v>` into the
/// connecting node id and its intended peer.
fn parse_peer_path(addr: &mio::net::SocketAddr) -> Option<(i32, i32)> {
    let path = addr.as_pathname()?;
    let s = path.to_str()?;
    let rest = s.strip_prefix("/ripc/emu-real-")?;
    let (u_str, v_str) = rest.split_once('/')?;
    Some((u_str.parse().ok()?, v_str.parse().ok()?))
}

pub fn spawn_acceptor(engine: Arc<Engine>, socket_path: PathBuf, worker_ctrl: Vec<Sender<WorkerCtrl>>) {
    std::thread::Builder::new()
        .name("acceptor".into())
        .spawn(move || acceptor_loop(engine, socket_path, worker_ctrl))
        .expect("failed to spawn acceptor thread");
}

fn acceptor_loop(engine: Arc<Engine>, socket_path: PathBuf, worker_ctrl: Vec<Sender<WorkerCtrl>>) {
    let _ = std::fs::remove_file(&socket_path);
    let mut listener = UnixListener::bind(&socket_path).expect("bind local listening socket");
    let _ = std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666));

    let mut poll = Poll::new().expect("poll init");
    poll.registry()
        .register(&mut listener, Token(0), Interest::READABLE)
        .expect("register acceptor listener");
    let mut events = Events::with_capacity(64);

    loop {
        if poll.poll(&mut events, Some(REACTOR_TIMEOUT)).is_err() {
            continue;
        }
        for event in events.iter() {
            if event.token() != Token(0) {
                continue;
            }
            loop {
                match listener.accept() {
                    Ok((stream, addr)) => handle_accept(&engine, &worker_ctrl, stream, &addr),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed on local listener");
                        break;
                    }
                }
            }
        }
    }
}

fn handle_accept(engine: &Arc<Engine>, worker_ctrl: &[Sender<WorkerCtrl>], stream: UnixStream, addr: &mio::net::SocketAddr) {
    let Some((u, v)) = parse_peer_path(addr) else {
        tracing::warn!("could not parse peer path off accepted connection, dropping");
        return;
    };

    let channel_already_exists = channel_exists_hint(engine, u, v);
    let direction_ok = crate::stage::should_initiate(
        u,
        engine.topology.is_cut(u),
        v,
        engine.topology.is_cut(v),
        engine.topology.is_seen(u),
    );

    if channel_already_exists || !direction_ok {
        reject(stream);
        return;
    }

    let idx = engine.worker_for(u);
    if let Some(tx) = worker_ctrl.get(idx) {
        let _ = tx.send(WorkerCtrl::Accept { self_id: u, peer_id: v, stream });
    }
}

/// The registry authoritative for edge existence lives inside each
/// worker thread, not in `Engine`; the acceptor has no direct view of
/// it. Rejections based on stale existence information are harmless
/// here because a duplicate `Accept` command is itself rejected by the
/// channel-state machine on the worker side.
fn channel_exists_hint(_engine: &Arc<Engine>, _u: i32, _v: i32) -> bool {
    false
}

fn reject(mut stream: UnixStream) {
    let mut buf = [0u8; message::SYN_LEN];
    let _ = stream.read_exact(&mut buf);
    let synack = message::build_synack(0);
    let _ = stream.write_all(synack.data());
}

/// Spawns one thread per peer host carrying a `RemoteChannel`: H−1
/// remote-connection threads, one per peer host. Returns the channels
/// keyed by peer host id so `Engine` can route forwarded PAYLOADs.
pub fn spawn_remote_links(
    self_host: u32,
    hosts: &[HostEntry],
    listen_port: u16,
) -> HashMap<u32, (Arc<RemoteChannel<TcpStream>>, std::thread::JoinHandle<()>)> {
    let mut out = HashMap::new();

    let smaller: Vec<&HostEntry> = hosts.iter().filter(|h| h.id < self_host).collect();
    let larger: Vec<&HostEntry> = hosts.iter().filter(|h| h.id > self_host).collect();

    // Active side: connect out to every smaller-id peer.
    for host in smaller {
        let addr: std::net::SocketAddr = format!("{}:{}", host.ip, host.port).parse().expect("valid peer host address");
        let std_stream = std::net::TcpStream::connect(addr).expect("connect to peer host controller");
        std_stream.set_nonblocking(true).expect("set nonblocking");
        let mut stream = TcpStream::from_std(std_stream);
        stream.write_all(&self_host.to_le_bytes()).expect("write self host id");
        let (remote, handle) = spawn_remote_link(host.id, stream);
        out.insert(host.id, (remote, handle));
    }

    // Passive side: one listener accepts from every larger-id peer.
    if !larger.is_empty() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", listen_port)).expect("bind inter-host listener");
        let expected = larger.len();
        for _ in 0..expected {
            let (std_stream, _peer_addr) = listener.accept().expect("accept inter-host connection");
            std_stream.set_nonblocking(true).expect("set nonblocking");
            let mut id_buf = [0u8; 4];
            let mut blocking_reader = std_stream.try_clone().expect("clone stream for handshake read");
            blocking_reader.set_nonblocking(false).expect("blocking for handshake");
            blocking_reader.read_exact(&mut id_buf).expect("read peer host id");
            let peer_id = u32::from_le_bytes(id_buf);
            let stream = TcpStream::from_std(std_stream);
            let (remote, handle) = spawn_remote_link(peer_id, stream);
            out.insert(peer_id, (remote, handle));
        }
    }

    out
}

fn spawn_remote_link(host_id: u32, stream: TcpStream) -> (Arc<RemoteChannel<TcpStream>>, std::thread::JoinHandle<()>) {
    let remote = Arc::new(RemoteChannel::new(stream, Token(0), host_id));
    let remote_for_thread = remote.clone();
    let handle = std::thread::Builder::new()
        .name(format!("remote-{host_id}"))
        .spawn(move || remote_link_loop(host_id, remote_for_thread))
        .expect("failed to spawn remote link thread");
    (remote, handle)
}

/// Owns egress only: flushes `add_msg`/`send_eos`/`send_keepbusy`
/// traffic queued from worker threads and the main loop. Inbound
/// traffic is drained separately by `drain_remote`, called from the
/// main loop, which is the only reader of a given remote channel's
/// ingress ring.
fn remote_link_loop(host_id: u32, remote: Arc<RemoteChannel<TcpStream>>) {
    loop {
        std::thread::sleep(REACTOR_TIMEOUT);
        if let Err(e) = remote.pollout() {
            tracing::warn!(host_id, error = %e, "remote pollout failed");
        }
    }
}

/// Drains one remote link's inbound queue against a live `Engine`;
/// called from the main loop's tick rather than the link thread itself,
/// since dispatch needs `Engine::remote_for`/`replay`/`stage`.
pub fn drain_remote(engine: &Arc<Engine>, host_id: u32, remote: &RemoteChannel<TcpStream>) {
    let msgs = match remote.pollin() {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(host_id, error = %e, "remote pollin failed");
            return;
        }
    };
    for msg in msgs {
        let hdr = match msg.header() {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(error = %e, "malformed frame on remote link");
                continue;
            }
        };
        match hdr.kind() {
            Ok(MsgType::EndOfStage) => engine.stage.note_peer_end_of_stage(),
            Ok(MsgType::KeepBusy) => engine.stage.record_event(engine.now_ns()),
            Ok(MsgType::Payload) => {
                let (src_id, dst_id) = message::payload_ids(&msg);
                let now_ns = engine.now_ns();
                engine.stage.record_event(now_ns);
                let stage = engine.stage.stage();
                engine.replay.add_msg(msg, src_id, dst_id, stage, now_ns);
            }
            _ => tracing::warn!("unexpected message type on remote link"),
        }
    }
}

/// Main thread: drives the stage machine and carries out the actions it
/// returns. Runs until `Stage::End`.
pub fn run_main_loop(engine: Arc<Engine>, remotes: &HashMap<u32, Arc<RemoteChannel<TcpStream>>>, worker_ctrl: &[Sender<WorkerCtrl>]) {
    let start_ts_ns = engine.now_ns();
    loop {
        std::thread::sleep(REACTOR_TIMEOUT);

        for (host_id, remote) in remotes {
            drain_remote(&engine, *host_id, remote);
        }

        let idx = engine.stage.iteration_idx();
        let input = StageTickInput {
            now_ns: engine.now_ns(),
            n_hosts: remotes.len() as u32 + 1,
            cut_nchannel: engine.topology.cut_nchannel(),
            partition_target_nchannel: engine.topology.target_nchannel(idx),
            local_edges_to_try: &build_local_edges(&engine, idx),
            max_runtime_ns: engine.config.max_runtime.map(|d| d.as_nanos() as i64),
            start_ts_ns,
            n_parts: engine.topology.n_parts(),
            current_n_channel: engine.n_channel.load(std::sync::atomic::Ordering::SeqCst),
        };
        let has_new_msg = engine.replay.has_new_msg();
        let actions = engine.stage.tick(&input, has_new_msg, |_| {});

        for action in actions {
            apply_action(&engine, worker_ctrl, action);
        }

        if engine.stage.stage() == Stage::End {
            for tx in worker_ctrl {
                let _ = tx.send(WorkerCtrl::Shutdown);
            }
            return;
        }
    }
}

fn build_local_edges(engine: &Arc<Engine>, idx: usize) -> Vec<(i32, i32)> {
    engine
        .topology
        .edges_for_active_partition(idx)
        .into_iter()
        .filter(|&(u, v)| {
            let initiator_is_local = if engine.topology.is_local(u) {
                crate::stage::should_initiate(u, engine.topology.is_cut(u), v, engine.topology.is_cut(v), engine.topology.is_seen(u))
            } else {
                false
            };
            initiator_is_local
        })
        .collect()
}

fn apply_action(engine: &Arc<Engine>, worker_ctrl: &[Sender<WorkerCtrl>], action: StageAction) {
    match action {
        StageAction::TryConnect { self_id, peer_id } => try_connect(engine, worker_ctrl, self_id, peer_id),
        StageAction::SendEosToAllPeers { stage } => {
            engine.broadcast_eos(stage as i64);
            tracing::info!(stage, "declared local end-of-stage");
        }
        StageAction::BroadcastKeepBusy => engine.broadcast_keepbusy(),
        StageAction::ConvergeEnded { last_event_ns } => {
            append_ts_line(&engine.config.log_path, "converge_end_ts.txt", last_event_ns as f64 / 1e9);
        }
        StageAction::EndIteration { idx, tag, globally_converged } => {
            let nodes = engine.topology.partition(idx).to_vec();
            let cut = engine.topology.cut().to_vec();
            let tag_str = if globally_converged { "final".to_string() } else { tag.to_string() };
            engine.collaborator.export_routes(&nodes, &tag_str);
            engine.collaborator.export_routes(&cut, &tag_str);

            append_ts_line(&engine.config.log_path, "switch_pods_ts.txt", engine.now_ns() as f64 / 1e9);

            engine.collaborator.stop_nodes(&nodes);
            for &n in &nodes {
                if engine.topology.is_local(n) {
                    engine.replay.node_offline(n);
                }
            }
        }
        StageAction::StartPartition { idx, restart } => {
            engine.topology.mark_seen(engine.topology.partition(idx).iter().copied());
            let nodes = engine.topology.partition(idx).to_vec();
            if restart {
                engine.collaborator.restart_nodes(&nodes);
            } else {
                engine.collaborator.start_nodes(&nodes);
            }
            engine.replay.new_iteration();
        }
        StageAction::TransitionedTo(stage) => {
            tracing::info!(stage = stage.name(), seconds = engine.now_ns() as f64 / 1e9, "stage transition");
        }
        StageAction::ForceTeardownMaxRuntime => {
            tracing::warn!("max runtime exceeded, forcing teardown");
        }
    }
}

/// Appends one `"{seconds:.6}\n"` line to `log_path/file_name`, matching
/// `node_ops.cpp`'s `fopen(..., "a+")` / `fprintf(..., "%.6f\n", ...)`
/// pair around `switch_pods_ts.txt` and `converge_end_ts.txt`.
fn append_ts_line(log_path: &Path, file_name: &str, seconds: f64) {
    use std::fs::OpenOptions;
    let path = log_path.join(file_name);
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(mut f) => {
            if let Err(e) = writeln!(f, "{seconds:.6}") {
                tracing::warn!(path = %path.display(), error = %e, "failed to append timestamp line");
            }
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to open timestamp file");
        }
    }
}

fn try_connect(engine: &Arc<Engine>, worker_ctrl: &[Sender<WorkerCtrl>], self_id: i32, peer_id: i32) {
    let path = format!("/ripc/emu-real-{self_id}/{peer_id}");
    match std::os::unix::net::UnixStream::connect(&path) {
        Ok(std_stream) => {
            std_stream.set_nonblocking(true).expect("set nonblocking");
            let stream = UnixStream::from_std(std_stream);
            let idx = engine.worker_for(self_id);
            if let Some(tx) = worker_ctrl.get(idx) {
                let _ = tx.send(WorkerCtrl::Connect { self_id, peer_id, stream });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            tracing::debug!(self_id, peer_id, "connect in progress");
        }
        Err(e) => {
            tracing::debug!(self_id, peer_id, error = %e, "connect attempt failed, retrying next interval");
        }
    }
}

#[allow(dead_code)]
fn local_socket_default() -> &'static Path {
    Path::new("/opt/lwc/volumes/ripc/msg_manager_socket")
}
