//! Client side of the remote fabric.
//!
//! Each calling thread gets its own socket, created on first use, so
//! request/reply pairs never interleave across threads and no lock is held
//! while waiting on the server. The first connection a process opens is
//! special: the server keeps it as the event channel and pushes
//! asynchronous messages down it, so [`RemoteFabric::connect`] opens it
//! eagerly and hands it back as an [`EventReceiver`].

use crate::wire::{
    decode_cycle_event, decode_header, decode_ping_ack, decode_read_ack_classic,
    decode_read_ack_fd, decode_read_many_ack_classic, decode_read_many_ack_fd, decode_ret_ack,
    encode_create_fifo, encode_empty_req, encode_flush, encode_handle_req, encode_install_fault,
    encode_ping, encode_read_many, encode_set_filter, encode_write_classic, encode_write_fd,
    encode_write_many_classic, encode_write_many_fd, CMD_DELETE_FIFO, CMD_KILL_THREAD,
    CMD_READ_FD_FRAME, CMD_READ_FD_FRAMES, CMD_READ_FRAME, CMD_READ_FRAMES, CMD_RESET_FAULT,
    CMD_TERMINATE, EVENT_CYCLE, HEADER_LEN, MAX_MSG_LEN,
};
use can_fabric::{
    AcceptRule, CanFdFrame, CanFrame, FabricError, FabricOps, FaultRequest, FifoHandle, FlushMask,
    OverflowPolicy,
};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Transport-layer failures, kept separate from fabric sentinels.
#[derive(Debug)]
pub enum RemoteError {
    Io(io::Error),
    Protocol(&'static str),
    Disconnected,
    Timeout,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Io(err) => write!(f, "io error: {err}"),
            RemoteError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            RemoteError::Disconnected => write!(f, "server closed the connection"),
            RemoteError::Timeout => write!(f, "timed out waiting for the server"),
        }
    }
}

impl Error for RemoteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RemoteError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RemoteError {
    fn from(err: io::Error) -> Self {
        RemoteError::Io(err)
    }
}

struct Connection {
    stream: TcpStream,
    thread_id: u32,
    packet_counter: u16,
    rx: Vec<u8>,
}

impl Connection {
    fn open(addr: SocketAddr, thread_id: u32) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            thread_id,
            packet_counter: 0,
            rx: Vec::new(),
        })
    }
}

/// Pull one complete framed message out of the accumulator, reading more
/// bytes as needed. A message may span several reads and one read may carry
/// several messages; leftovers stay buffered.
fn read_one_msg(stream: &mut TcpStream, rx: &mut Vec<u8>) -> Result<Vec<u8>, RemoteError> {
    loop {
        if rx.len() >= 4 {
            let size = u32::from_le_bytes([rx[0], rx[1], rx[2], rx[3]]) as usize;
            if !(HEADER_LEN..=MAX_MSG_LEN).contains(&size) {
                return Err(RemoteError::Protocol("message size out of range"));
            }
            if rx.len() >= size {
                let rest = rx.split_off(size);
                let msg = std::mem::replace(rx, rest);
                return Ok(msg);
            }
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(RemoteError::Disconnected);
        }
        rx.extend_from_slice(&chunk[..n]);
    }
}

/// Proxy implementing [`FabricOps`] over the wire protocol.
pub struct RemoteFabric {
    addr: SocketAddr,
    connections: Mutex<HashMap<ThreadId, Arc<Mutex<Connection>>>>,
    next_thread_id: AtomicU32,
}

impl RemoteFabric {
    /// Connect to a fabric server. The first socket opened becomes the
    /// event channel and is returned as an [`EventReceiver`].
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<(Self, EventReceiver)> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
        let event_stream = TcpStream::connect(addr)?;
        event_stream.set_nodelay(true)?;
        Ok((
            Self {
                addr,
                connections: Mutex::new(HashMap::new()),
                next_thread_id: AtomicU32::new(1),
            },
            EventReceiver {
                stream: event_stream,
                rx: Vec::new(),
            },
        ))
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>, RemoteError> {
        let key = std::thread::current().id();
        let mut table = self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = table.get(&key) {
            return Ok(Arc::clone(conn));
        }
        let thread_id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Mutex::new(Connection::open(self.addr, thread_id)?));
        table.insert(key, Arc::clone(&conn));
        Ok(conn)
    }

    /// Send one framed request and block for its acknowledgement. The
    /// builder receives this thread's wire id and the next packet counter.
    fn transact(
        &self,
        build: impl FnOnce(u32, u16) -> Vec<u8>,
    ) -> Result<Vec<u8>, RemoteError> {
        let conn = self.connection()?;
        let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.packet_counter = conn.packet_counter.wrapping_add(1);
        let msg = build(conn.thread_id, conn.packet_counter);
        let sent_command = decode_header(&msg)
            .map_err(RemoteError::Protocol)?
            .command;
        conn.stream.write_all(&msg)?;

        let Connection { stream, rx, .. } = &mut *conn;
        let reply = read_one_msg(stream, rx)?;
        let header = decode_header(&reply).map_err(RemoteError::Protocol)?;
        if header.command != sent_command {
            return Err(RemoteError::Protocol("acknowledgement command mismatch"));
        }
        Ok(reply)
    }

    /// Fire a request the server never acknowledges.
    fn send_only(&self, command: u32) -> Result<(), RemoteError> {
        let conn = self.connection()?;
        let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.packet_counter = conn.packet_counter.wrapping_add(1);
        let msg = encode_empty_req(command, conn.thread_id, conn.packet_counter);
        conn.stream.write_all(&msg)?;
        Ok(())
    }

    /// Ask the server to shut its listener down. No reply is sent.
    pub fn terminate(&self) -> Result<(), RemoteError> {
        self.send_only(CMD_TERMINATE)?;
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }

    /// Close this thread's server-side worker and drop its socket.
    pub fn disconnect_thread(&self) {
        let key = std::thread::current().id();
        let conn = self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        if let Some(conn) = conn {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.packet_counter = conn.packet_counter.wrapping_add(1);
            let msg = encode_empty_req(CMD_KILL_THREAD, conn.thread_id, conn.packet_counter);
            let _ = conn.stream.write_all(&msg);
        }
    }

    fn ret_call(&self, build: impl FnOnce(u32, u16) -> Vec<u8>) -> Result<i32, FabricError> {
        let reply = self.transact(build).map_err(|_| FabricError::Transport)?;
        decode_ret_ack(&reply).map_err(|_| FabricError::Transport)
    }
}

fn check_ret(ret: i32) -> Result<i32, FabricError> {
    match FabricError::from_ret(ret) {
        Some(err) => Err(err),
        None => Ok(ret),
    }
}

impl FabricOps for RemoteFabric {
    fn create_fifo(
        &self,
        depth: usize,
        fd: bool,
        policy: OverflowPolicy,
    ) -> Result<FifoHandle, FabricError> {
        let ret = self.ret_call(|tid, ctr| {
            encode_create_fifo(tid, ctr, depth as i32, fd, policy.to_raw())
        })?;
        Ok(FifoHandle::from_raw(check_ret(ret)?))
    }

    fn delete_fifo(&self, handle: FifoHandle) -> Result<(), FabricError> {
        let ret =
            self.ret_call(|tid, ctr| encode_handle_req(CMD_DELETE_FIFO, tid, ctr, handle.raw()))?;
        check_ret(ret).map(|_| ())
    }

    fn set_accept_filter(
        &self,
        handle: FifoHandle,
        rules: &[AcceptRule],
    ) -> Result<(), FabricError> {
        let ret = self.ret_call(|tid, ctr| encode_set_filter(tid, ctr, handle.raw(), rules))?;
        check_ret(ret).map(|_| ())
    }

    fn flush(&self, handle: FifoHandle, mask: FlushMask) -> Result<(), FabricError> {
        let ret = self.ret_call(|tid, ctr| encode_flush(tid, ctr, handle.raw(), mask.bits()))?;
        check_ret(ret).map(|_| ())
    }

    fn read_frame(&self, handle: FifoHandle) -> Result<Option<CanFrame>, FabricError> {
        let reply = self
            .transact(|tid, ctr| encode_handle_req(CMD_READ_FRAME, tid, ctr, handle.raw()))
            .map_err(|_| FabricError::Transport)?;
        let ret = decode_ret_ack(&reply).map_err(|_| FabricError::Transport)?;
        check_ret(ret)?;
        decode_read_ack_classic(&reply).map_err(|_| FabricError::Transport)
    }

    fn read_frames(&self, handle: FifoHandle, max: usize) -> Result<Vec<CanFrame>, FabricError> {
        let reply = self
            .transact(|tid, ctr| {
                encode_read_many(CMD_READ_FRAMES, tid, ctr, handle.raw(), max as i32)
            })
            .map_err(|_| FabricError::Transport)?;
        let ret = decode_ret_ack(&reply).map_err(|_| FabricError::Transport)?;
        check_ret(ret)?;
        decode_read_many_ack_classic(&reply).map_err(|_| FabricError::Transport)
    }

    fn write_frame(&self, handle: FifoHandle, frame: &CanFrame) -> Result<(), FabricError> {
        let ret = self.ret_call(|tid, ctr| encode_write_classic(tid, ctr, handle.raw(), frame))?;
        check_ret(ret).map(|_| ())
    }

    fn write_frames(&self, handle: FifoHandle, frames: &[CanFrame]) -> Result<usize, FabricError> {
        let ret =
            self.ret_call(|tid, ctr| encode_write_many_classic(tid, ctr, handle.raw(), frames))?;
        check_ret(ret).map(|written| written as usize)
    }

    fn read_fd_frame(&self, handle: FifoHandle) -> Result<Option<CanFdFrame>, FabricError> {
        let reply = self
            .transact(|tid, ctr| encode_handle_req(CMD_READ_FD_FRAME, tid, ctr, handle.raw()))
            .map_err(|_| FabricError::Transport)?;
        let ret = decode_ret_ack(&reply).map_err(|_| FabricError::Transport)?;
        check_ret(ret)?;
        decode_read_ack_fd(&reply).map_err(|_| FabricError::Transport)
    }

    fn read_fd_frames(
        &self,
        handle: FifoHandle,
        max: usize,
    ) -> Result<Vec<CanFdFrame>, FabricError> {
        let reply = self
            .transact(|tid, ctr| {
                encode_read_many(CMD_READ_FD_FRAMES, tid, ctr, handle.raw(), max as i32)
            })
            .map_err(|_| FabricError::Transport)?;
        let ret = decode_ret_ack(&reply).map_err(|_| FabricError::Transport)?;
        check_ret(ret)?;
        decode_read_many_ack_fd(&reply).map_err(|_| FabricError::Transport)
    }

    fn write_fd_frame(&self, handle: FifoHandle, frame: &CanFdFrame) -> Result<(), FabricError> {
        let ret = self.ret_call(|tid, ctr| encode_write_fd(tid, ctr, handle.raw(), frame))?;
        check_ret(ret).map(|_| ())
    }

    fn write_fd_frames(
        &self,
        handle: FifoHandle,
        frames: &[CanFdFrame],
    ) -> Result<usize, FabricError> {
        let ret =
            self.ret_call(|tid, ctr| encode_write_many_fd(tid, ctr, handle.raw(), frames))?;
        check_ret(ret).map(|written| written as usize)
    }

    fn install_fault(&self, req: &FaultRequest) -> Result<(), FabricError> {
        let ret = self.ret_call(|tid, ctr| encode_install_fault(tid, ctr, req))?;
        check_ret(ret).map(|_| ())
    }

    fn reset_fault(&self) -> Result<(), FabricError> {
        let ret = self.ret_call(|tid, ctr| encode_empty_req(CMD_RESET_FAULT, tid, ctr))?;
        check_ret(ret).map(|_| ())
    }

    fn ping(&self, value: u32) -> Result<u32, FabricError> {
        let reply = self
            .transact(|tid, ctr| encode_ping(tid, ctr, value))
            .map_err(|_| FabricError::Transport)?;
        decode_ping_ack(&reply).map_err(|_| FabricError::Transport)
    }
}

/// Asynchronous server-to-client messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FabricEvent {
    /// The server's scheduler advanced to this cycle.
    Cycle(u64),
}

/// Receiving half of the reserved first connection.
pub struct EventReceiver {
    stream: TcpStream,
    rx: Vec<u8>,
}

impl EventReceiver {
    /// Block until the next event arrives. Unknown commands are skipped.
    pub fn recv(&mut self) -> Result<FabricEvent, RemoteError> {
        loop {
            let msg = read_one_msg(&mut self.stream, &mut self.rx)?;
            let header = decode_header(&msg).map_err(RemoteError::Protocol)?;
            if header.command == EVENT_CYCLE {
                let cycle = decode_cycle_event(&msg).map_err(RemoteError::Protocol)?;
                return Ok(FabricEvent::Cycle(cycle));
            }
        }
    }

    /// Like [`recv`](Self::recv) with an upper bound on the wait.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<FabricEvent, RemoteError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.buffered_msg()? {
                let header = decode_header(&msg).map_err(RemoteError::Protocol)?;
                if header.command == EVENT_CYCLE {
                    let cycle = decode_cycle_event(&msg).map_err(RemoteError::Protocol)?;
                    return Ok(FabricEvent::Cycle(cycle));
                }
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !wait_readable(&self.stream, remaining)? {
                return Err(RemoteError::Timeout);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(RemoteError::Disconnected);
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }

    fn buffered_msg(&mut self) -> Result<Option<Vec<u8>>, RemoteError> {
        if self.rx.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_le_bytes([self.rx[0], self.rx[1], self.rx[2], self.rx[3]]) as usize;
        if !(HEADER_LEN..=MAX_MSG_LEN).contains(&size) {
            return Err(RemoteError::Protocol("message size out of range"));
        }
        if self.rx.len() < size {
            return Ok(None);
        }
        let rest = self.rx.split_off(size);
        let msg = std::mem::replace(&mut self.rx, rest);
        Ok(Some(msg))
    }
}

fn wait_readable(stream: &TcpStream, timeout: Duration) -> Result<bool, RemoteError> {
    use std::os::fd::AsRawFd;

    let mut fds = libc::pollfd {
        fd: stream.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let rc = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
    if rc < 0 {
        return Err(RemoteError::Io(io::Error::last_os_error()));
    }
    Ok(rc > 0)
}
