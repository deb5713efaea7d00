//! Remote channel: one duplex connection to a peer host controller.
//!
//! Grounded on `original_source/controller/remote_channel.cpp`. Unlike a
//! local channel, the send queue is mutex-guarded because multiple worker
//! threads (forwarding PAYLOADs) and the stage machine (EOS/KEEPBUSY) all
//! enqueue concurrently.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use mio::Token;

use crate::error::ChannelError;
use crate::message::{self, Header, Message};
use crate::ring::RingBuffer;

/// Inter-host rings start at 1 MiB, matching the original's `1 << 20`
/// sizing for ingress and egress.
pub const REMOTE_RING_SIZ: usize = 1 << 20;

pub struct RemoteChannel<S> {
    pub stream: Mutex<S>,
    pub token: Token,
    pub host_id: u32,
    state: Mutex<RemoteState>,
}

struct RemoteState {
    rb_in: RingBuffer,
    rb_out: RingBuffer,
    queue: VecDeque<Message>,
    writable_armed: bool,
}

impl<S: io::Read + io::Write> RemoteChannel<S> {
    pub fn new(stream: S, token: Token, host_id: u32) -> Self {
        RemoteChannel {
            stream: Mutex::new(stream),
            token,
            host_id,
            state: Mutex::new(RemoteState {
                rb_in: RingBuffer::new(REMOTE_RING_SIZ),
                rb_out: RingBuffer::new(REMOTE_RING_SIZ),
                queue: VecDeque::new(),
                writable_armed: false,
            }),
        }
    }

    pub fn wants_write(&self) -> bool {
        self.state.lock().unwrap().writable_armed
    }

    pub fn add_msg(&self, msg: Message) {
        let mut st = self.state.lock().unwrap();
        st.queue.push_back(msg);
        st.writable_armed = true;
    }

    pub fn send_eos(&self, stage: i64) {
        self.add_msg(message::build_end_of_stage(stage));
    }

    pub fn send_keepbusy(&self) {
        self.add_msg(message::build_keepbusy());
    }

    pub fn pollout(&self) -> Result<(), ChannelError> {
        let mut st = self.state.lock().unwrap();
        let mut stream = self.stream.lock().unwrap();

        while let Some(front) = st.queue.front() {
            if front.len() <= st.rb_out.writable() {
                let m = st.queue.pop_front().unwrap();
                st.rb_out.put(m.data())?;
            } else {
                break;
            }
        }

        let to_send = st.rb_out.readable();
        if to_send == 0 {
            if st.queue.is_empty() {
                st.writable_armed = false;
            }
            return Ok(());
        }

        let n = st.rb_out.write_to_fd(&mut *stream)?;
        if n > 0 {
            st.rb_out.consume(n)?;
        }
        st.writable_armed = !st.queue.is_empty() || st.rb_out.readable() > 0;
        Ok(())
    }

    pub fn pollin(&self) -> Result<Vec<Message>, ChannelError> {
        let mut st = self.state.lock().unwrap();
        let mut stream = self.stream.lock().unwrap();

        let n = st.rb_in.read_from_fd(&mut *stream)?;
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        loop {
            if st.rb_in.readable() < message::HDR_LEN {
                break;
            }
            let mut hdr_buf = [0u8; message::HDR_LEN];
            st.rb_in.peek(&mut hdr_buf)?;
            let hdr = Header::parse(&hdr_buf)?;
            let msg_len = hdr.msg_len as usize;
            while msg_len > st.rb_in.capacity() {
                st.rb_in.expand();
            }
            if st.rb_in.readable() < msg_len {
                break;
            }
            let mut buf = vec![0u8; msg_len];
            st.rb_in.get(&mut buf)?;
            out.push(Message::from_bytes(buf));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

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

    #[test]
    fn send_eos_carries_stage_in_seq() {
        let rc = RemoteChannel::new(pipe(), Token(0), 1);
        rc.send_eos(3);
        rc.pollout().unwrap();
        let out = rc.stream.lock().unwrap().outbound.clone();
        let hdr = Header::parse(&out).unwrap();
        assert_eq!(hdr.seq, 3);
    }

    #[test]
    fn pollout_disarms_writable_once_drained() {
        let rc = RemoteChannel::new(pipe(), Token(0), 1);
        rc.send_keepbusy();
        assert!(rc.wants_write());
        rc.pollout().unwrap();
        assert!(!rc.wants_write());
    }

    #[test]
    fn pollin_extracts_forwarded_payload() {
        let rc = RemoteChannel::new(pipe(), Token(0), 1);
        let payload = message::build_payload(1, 2, &[0u8; 19]);
        rc.stream.lock().unwrap().inbound = Cursor::new(payload.data().to_vec());
        let msgs = rc.pollin().unwrap();
        assert_eq!(msgs.len(), 1);
    }
}
