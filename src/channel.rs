//! Local channel: one non-blocking connection to one emulated router.
//!
//! Grounded on `original_source/controller/channel.{hpp,cpp}`. The
//! four-state handshake and the sticky `established` flag driving the
//! `n_channel` counter follow that source closely. `n_channel` itself is
//! not a free-standing global: it is the one `Engine`-owned counter
//! (`Engine::n_channel`) shared into every `LocalChannel` at construction
//! time, the same way `PortAllocator` is `Engine`-owned rather than a
//! process static (SPEC_FULL.md §3/§9).

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use mio::Token;

use crate::error::ChannelError;
use crate::message::{self, BgpType, Header, Message, MsgType};
use crate::ring::{RingBuffer, RINGBUFFER_IN_SIZ, RINGBUFFER_OUT_SIZ};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    ConnInProgress,
    Accepted,
    ChannelEstablished,
    BgpEstablished,
}

impl ChannelState {
    fn name(self) -> &'static str {
        match self {
            ChannelState::ConnInProgress => "CONN_INPROGRESS",
            ChannelState::Accepted => "ACCEPTED",
            ChannelState::ChannelEstablished => "CHANNEL_ESTABLISHED",
            ChannelState::BgpEstablished => "BGP_ESTABLISHED",
        }
    }
}

/// What the owning reactor should do after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    Continue,
    Destroy,
}

pub struct LocalChannel<S> {
    pub stream: S,
    pub token: Token,
    pub self_id: i32,
    pub peer_id: i32,
    state: ChannelState,
    established: bool,
    writable_armed: bool,
    rb_in: RingBuffer,
    rb_out: RingBuffer,
    pending_out: VecDeque<Message>,
    n_channel: Arc<AtomicI64>,
}

impl<S: io::Read + io::Write> LocalChannel<S> {
    pub fn new(
        stream: S,
        token: Token,
        self_id: i32,
        peer_id: i32,
        init_state: ChannelState,
        n_channel: Arc<AtomicI64>,
    ) -> Self {
        LocalChannel {
            stream,
            token,
            self_id,
            peer_id,
            state: init_state,
            established: false,
            writable_armed: matches!(init_state, ChannelState::ConnInProgress),
            rb_in: RingBuffer::new(RINGBUFFER_IN_SIZ),
            rb_out: RingBuffer::new(RINGBUFFER_OUT_SIZ),
            pending_out: VecDeque::new(),
            n_channel,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn bgp_is_established(&self) -> bool {
        self.established
    }

    pub fn wants_write(&self) -> bool {
        self.writable_armed
    }

    /// Outbound connect became writable: move to CHANNEL_ESTABLISHED and
    /// enqueue a SYN.
    pub fn on_connect_ok(&mut self) -> Result<(), ChannelError> {
        if self.state != ChannelState::ConnInProgress {
            return Err(ChannelError::InvalidTransition {
                from: self.state.name(),
                event: "on_connect_ok",
            });
        }
        self.state = ChannelState::ChannelEstablished;
        let syn = message::build_syn(self.self_id, self.peer_id, 0);
        self.sendmsg(syn)
    }

    /// First full inbound SYN on the passive side: move to
    /// CHANNEL_ESTABLISHED and enqueue a SYNACK.
    pub fn on_receive_syn(&mut self, cli_port: u16) -> Result<(), ChannelError> {
        if self.state != ChannelState::Accepted {
            return Err(ChannelError::InvalidTransition {
                from: self.state.name(),
                event: "on_receive_syn",
            });
        }
        self.state = ChannelState::ChannelEstablished;
        let synack = message::build_synack(cli_port);
        self.sendmsg(synack)
    }

    /// First inbound BGP keepalive through the replay path: sticky
    /// transition to BGP_ESTABLISHED, incrementing the global counter
    /// exactly once.
    pub fn on_bgp_established(&mut self) -> Result<(), ChannelError> {
        if self.state != ChannelState::ChannelEstablished {
            return Err(ChannelError::InvalidTransition {
                from: self.state.name(),
                event: "on_bgp_established",
            });
        }
        self.state = ChannelState::BgpEstablished;
        self.established = true;
        self.n_channel.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Arms writable interest, grows the egress ring to fit `m` if
    /// needed, enqueues at the tail. Never blocks.
    pub fn sendmsg(&mut self, m: Message) -> Result<(), ChannelError> {
        while m.len() > self.rb_out.capacity() {
            self.rb_out.expand();
        }
        self.writable_armed = true;
        self.pending_out.push_back(m);
        Ok(())
    }

    /// Pulls bytes into the ingress ring, expanding as needed to fit any
    /// message the header declares, and peels off every complete frame.
    pub fn pollin(&mut self) -> Result<Vec<Message>, ChannelError> {
        let n = self.rb_in.read_from_fd(&mut self.stream)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        loop {
            if self.rb_in.readable() < message::HDR_LEN {
                break;
            }
            let mut hdr_buf = [0u8; message::HDR_LEN];
            self.rb_in.peek(&mut hdr_buf)?;
            let hdr = Header::parse(&hdr_buf)?;
            let msg_len = hdr.msg_len as usize;
            while msg_len > self.rb_in.capacity() {
                self.rb_in.expand();
            }
            if self.rb_in.readable() < msg_len {
                break;
            }
            let mut buf = vec![0u8; msg_len];
            self.rb_in.get(&mut buf)?;
            out.push(Message::from_bytes(buf));
        }
        Ok(out)
    }

    /// Drains as many queued messages as fit into the egress ring, then
    /// issues one scatter write. Disarms writable interest once both the
    /// queue and the ring are empty.
    pub fn pollout(&mut self) -> Result<(), ChannelError> {
        while let Some(front) = self.pending_out.front() {
            if front.len() <= self.rb_out.writable() {
                let m = self.pending_out.pop_front().unwrap();
                self.rb_out.put(m.data())?;
            } else {
                break;
            }
        }

        let to_send = self.rb_out.readable();
        if to_send == 0 {
            if self.pending_out.is_empty() {
                self.writable_armed = false;
            }
            return Ok(());
        }

        let n = self.rb_out.write_to_fd(&mut self.stream)?;
        if n > 0 {
            self.rb_out.consume(n)?;
        }

        self.writable_armed = !self.pending_out.is_empty() || self.rb_out.readable() > 0;
        Ok(())
    }

    /// Hangup/error bits mean the owner (channel registry) must destroy
    /// this channel.
    pub fn pollerr(events: &mio::event::Event) -> PollResult {
        if events.is_read_closed() || events.is_write_closed() || events.is_error() {
            PollResult::Destroy
        } else {
            PollResult::Continue
        }
    }
}

impl<S> Drop for LocalChannel<S> {
    fn drop(&mut self) {
        if self.established {
            self.n_channel.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub fn is_session_type(bgp_type: u8) -> bool {
    bgp_type == BgpType::Open as u8 || bgp_type == BgpType::Keepalive as u8
}

#[allow(dead_code)]
pub fn msg_type_name(t: MsgType) -> &'static str {
    match t {
        MsgType::Syn => "SYN",
        MsgType::SynAck => "SYNACK",
        MsgType::Payload => "PAYLOAD",
        MsgType::Ack => "ACK",
        MsgType::EndOfStage => "ENDOFSTAGE",
        MsgType::KeepBusy => "KEEPBUSY",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Pipe {
        inbound: Cursor<Vec<u8>>,
        outbound: Vec<u8>,
    }

    impl io::Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inbound.read(buf)
        }
    }

    impl io::Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.write(buf)
        }
        fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
            self.outbound.write_vectored(bufs)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn pipe() -> Pipe {
        Pipe { inbound: Cursor::new(Vec::new()), outbound: Vec::new() }
    }

    fn counter() -> Arc<AtomicI64> {
        Arc::new(AtomicI64::new(0))
    }

    #[test]
    fn active_side_handshake_enqueues_syn() {
        let mut ch = LocalChannel::new(pipe(), Token(0), 1, 2, ChannelState::ConnInProgress, counter());
        ch.on_connect_ok().unwrap();
        assert_eq!(ch.state(), ChannelState::ChannelEstablished);
        ch.pollout().unwrap();
        assert!(!ch.stream.outbound.is_empty());
    }

    #[test]
    fn passive_side_rejects_on_bgp_established_before_channel_established() {
        let mut ch = LocalChannel::new(pipe(), Token(0), 1, 2, ChannelState::Accepted, counter());
        let err = ch.on_bgp_established().unwrap_err();
        assert!(matches!(err, ChannelError::InvalidTransition { .. }));
    }

    #[test]
    fn bgp_established_increments_and_drop_decrements_n_channel() {
        let n_channel = counter();
        {
            let mut ch = LocalChannel::new(pipe(), Token(0), 1, 2, ChannelState::ConnInProgress, n_channel.clone());
            ch.on_connect_ok().unwrap();
            ch.on_bgp_established().unwrap();
            assert_eq!(n_channel.load(Ordering::SeqCst), 1);
        }
        assert_eq!(n_channel.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_without_established_does_not_decrement() {
        let n_channel = counter();
        {
            let _ch = LocalChannel::new(pipe(), Token(0), 1, 2, ChannelState::Accepted, n_channel.clone());
        }
        assert_eq!(n_channel.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pollin_returns_only_complete_frames() {
        let mut ch = LocalChannel::new(pipe(), Token(0), 1, 2, ChannelState::ChannelEstablished, counter());
        let full = message::build_keepbusy();
        let mut bytes = full.data().to_vec();
        bytes.truncate(full.len() - 4); // partial frame
        ch.stream.inbound = Cursor::new(bytes);
        let msgs = ch.pollin().unwrap();
        assert!(msgs.is_empty());
    }

    #[test]
    fn pollin_extracts_two_back_to_back_messages() {
        let mut ch = LocalChannel::new(pipe(), Token(0), 1, 2, ChannelState::ChannelEstablished, counter());
        let mut bytes = message::build_keepbusy().data().to_vec();
        bytes.extend(message::build_keepbusy().data());
        ch.stream.inbound = Cursor::new(bytes);
        let msgs = ch.pollin().unwrap();
        assert_eq!(msgs.len(), 2);
    }
}
