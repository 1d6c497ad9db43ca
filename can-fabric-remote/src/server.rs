//! The remote-master server.
//!
//! One TCP listener, one worker thread per client connection. The first
//! accepted connection is kept aside as the event channel; the server only
//! ever writes to it. Every later connection gets a dedicated worker with a
//! small fixed stack that, on Linux, pins itself to a configurable CPU and
//! asks for `SCHED_FIFO` scheduling before touching any traffic. Connection
//! scratch buffers come from the [`RtArena`] so steady-state request
//! handling never hits the general-purpose heap.

use crate::alloc::RtArena;
use crate::wire::{
    decode_create_fifo, decode_flush, decode_handle_req, decode_header, decode_install_fault,
    decode_ping, decode_read_many, decode_set_filter, decode_write_classic, decode_write_fd,
    decode_write_many_classic, decode_write_many_fd, encode_cycle_event, encode_ping_ack_into,
    encode_read_ack_classic_into, encode_read_ack_fd_into, encode_read_many_ack_classic_into,
    encode_read_many_ack_fd_into, encode_ret_ack_into, CMD_CREATE_FIFO, CMD_DELETE_FIFO,
    CMD_FLUSH_FIFO, CMD_INSTALL_FAULT, CMD_KILL_THREAD, CMD_PING, CMD_READ_FD_FRAME,
    CMD_READ_FD_FRAMES, CMD_READ_FRAME, CMD_READ_FRAMES, CMD_RESET_FAULT, CMD_SET_ACCEPT_FILTER,
    CMD_TERMINATE, CMD_WRITE_FD_FRAME, CMD_WRITE_FD_FRAMES, CMD_WRITE_FRAME, CMD_WRITE_FRAMES,
    HEADER_LEN, MAX_MSG_LEN,
};
use can_fabric::{Fabric, FabricError, FabricOps, FifoHandle, FlushMask, OverflowPolicy};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Tuning knobs for [`FabricServer::start`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// CPU the workers pin themselves to; `None` leaves affinity alone.
    pub worker_cpu: Option<usize>,
    /// `SCHED_FIFO` priority requested by workers; `None` keeps the
    /// default policy. Linux only, a warning elsewhere never an error.
    pub rt_priority: Option<i32>,
    pub worker_stack: usize,
    pub arena_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8888)),
            worker_cpu: Some(1),
            rt_priority: Some(99),
            worker_stack: 256 * 1024,
            arena_capacity: 32 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Check the parameters for internal consistency.
    pub fn validate(&self) -> Result<(), &'static str> {
        if let Some(priority) = self.rt_priority {
            if !(1..=99).contains(&priority) {
                return Err("rt_priority must be between 1 and 99");
            }
        }
        if self.worker_stack < 64 * 1024 {
            return Err("worker_stack below 64 KiB");
        }
        if self.arena_capacity < 2 * MAX_MSG_LEN + 1024 {
            return Err("arena_capacity cannot hold one connection's buffers");
        }
        Ok(())
    }
}

/// A running fabric server. Dropping it shuts the listener down.
pub struct FabricServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
    event_conn: Arc<Mutex<Option<TcpStream>>>,
}

impl FabricServer {
    pub fn start(fabric: Arc<Fabric>, config: ServerConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
        let listener = TcpListener::bind(config.listen_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let arena = RtArena::with_capacity(config.arena_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let event_conn = Arc::new(Mutex::new(None));

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_events = Arc::clone(&event_conn);
        let accept_thread = thread::spawn(move || {
            accept_loop(
                listener,
                fabric,
                arena,
                config,
                accept_shutdown,
                accept_events,
            )
        });

        Ok(Self {
            local_addr,
            shutdown,
            accept_thread: Some(accept_thread),
            event_conn,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Push a cycle tick to the event channel, if a client holds one.
    pub fn notify_cycle(&self, cycle: u64) {
        let mut guard = self.event_conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = guard.as_mut() {
            if stream.write_all(&encode_cycle_event(cycle)).is_err() {
                *guard = None;
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        *self.event_conn.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl Drop for FabricServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    fabric: Arc<Fabric>,
    arena: RtArena,
    config: ServerConfig,
    shutdown: Arc<AtomicBool>,
    event_conn: Arc<Mutex<Option<TcpStream>>>,
) {
    let mut have_event_conn = false;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                if stream.set_nodelay(true).is_err() {
                    continue;
                }
                if !have_event_conn {
                    // The first connection is reserved for server-to-client
                    // events and carries no requests.
                    *event_conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);
                    have_event_conn = true;
                    continue;
                }
                let fabric = Arc::clone(&fabric);
                let arena = arena.clone();
                let worker_shutdown = Arc::clone(&shutdown);
                let cpu = config.worker_cpu;
                let priority = config.rt_priority;
                let spawned = thread::Builder::new()
                    .name("fabric-worker".into())
                    .stack_size(config.worker_stack)
                    .spawn(move || {
                        worker_loop(stream, fabric, arena, worker_shutdown, cpu, priority)
                    });
                if let Err(err) = spawned {
                    eprintln!("can-fabric-remote: worker spawn failed: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(err) => {
                eprintln!("can-fabric-remote: listener error: {err}");
                break;
            }
        }
    }
}

enum Dispatch {
    /// Send this many reply bytes from the transmit buffer.
    Reply(usize),
    /// Shut the whole listener down, no reply.
    Shutdown,
    /// Close only this connection, no reply.
    Close,
}

fn worker_loop(
    mut stream: TcpStream,
    fabric: Arc<Fabric>,
    arena: RtArena,
    shutdown: Arc<AtomicBool>,
    cpu: Option<usize>,
    priority: Option<i32>,
) {
    apply_realtime(cpu, priority);

    let Some(mut rx_buf) = arena.alloc(MAX_MSG_LEN) else {
        eprintln!("can-fabric-remote: arena exhausted, refusing connection");
        return;
    };
    let Some(mut tx_buf) = arena.alloc(MAX_MSG_LEN) else {
        eprintln!("can-fabric-remote: arena exhausted, refusing connection");
        return;
    };

    let mut filled = 0usize;
    loop {
        let n = match stream.read(&mut rx_buf[filled..]) {
            Ok(0) => return,
            Ok(n) => n,
            Err(err) => {
                if err.kind() != io::ErrorKind::ConnectionReset {
                    eprintln!("can-fabric-remote: worker read error: {err}");
                }
                return;
            }
        };
        filled += n;

        // Walk every complete message in the buffer; a request may span
        // reads and several requests may arrive in one read.
        let mut consumed = 0usize;
        while filled - consumed >= HEADER_LEN {
            let header = match decode_header(&rx_buf[consumed..filled]) {
                Ok(header) => header,
                Err(msg) => {
                    eprintln!("can-fabric-remote: bad request header: {msg}");
                    return;
                }
            };
            let size = header.size as usize;
            if filled - consumed < size {
                break;
            }
            let msg = &rx_buf[consumed..consumed + size];
            match dispatch(&fabric, msg, &mut tx_buf) {
                Ok(Dispatch::Reply(len)) => {
                    if let Err(err) = stream.write_all(&tx_buf[..len]) {
                        eprintln!("can-fabric-remote: worker write error: {err}");
                        return;
                    }
                }
                Ok(Dispatch::Shutdown) => {
                    shutdown.store(true, Ordering::SeqCst);
                    return;
                }
                Ok(Dispatch::Close) => return,
                Err(msg) => {
                    eprintln!("can-fabric-remote: bad request: {msg}");
                    return;
                }
            }
            consumed += size;
        }
        if consumed > 0 {
            rx_buf.copy_within(consumed..filled, 0);
            filled -= consumed;
        }
        if filled == rx_buf.len() {
            eprintln!("can-fabric-remote: request larger than the receive buffer");
            return;
        }
    }
}

/// A batch reply must fit the transmit buffer, whatever the client asked.
fn clamp_batch(max: i32) -> usize {
    (max.max(0) as usize).min(crate::wire::MAX_BATCH_FRAMES)
}

fn ret_of<T>(result: Result<T, FabricError>, ok: impl FnOnce(T) -> i32) -> i32 {
    match result {
        Ok(value) => ok(value),
        Err(err) => err.to_ret(),
    }
}

fn dispatch(fabric: &Fabric, msg: &[u8], out: &mut [u8]) -> Result<Dispatch, &'static str> {
    let header = decode_header(msg)?;
    let len = match header.command {
        CMD_PING => {
            let value = decode_ping(msg)?;
            encode_ping_ack_into(out, &header, value)
        }
        CMD_TERMINATE => return Ok(Dispatch::Shutdown),
        CMD_KILL_THREAD => return Ok(Dispatch::Close),
        CMD_CREATE_FIFO => {
            let req = decode_create_fifo(msg)?;
            let ret = ret_of(
                fabric.create_fifo(
                    req.depth.max(0) as usize,
                    req.fd,
                    OverflowPolicy::from_raw(req.policy_raw),
                ),
                |handle| handle.raw(),
            );
            encode_ret_ack_into(out, &header, ret)
        }
        CMD_DELETE_FIFO => {
            let handle = FifoHandle::from_raw(decode_handle_req(msg)?);
            encode_ret_ack_into(out, &header, ret_of(fabric.delete_fifo(handle), |_| 0))
        }
        CMD_FLUSH_FIFO => {
            let (handle, flags) = decode_flush(msg)?;
            let handle = FifoHandle::from_raw(handle);
            let ret = ret_of(fabric.flush(handle, FlushMask::from_bits(flags)), |_| 0);
            encode_ret_ack_into(out, &header, ret)
        }
        CMD_SET_ACCEPT_FILTER => {
            let (handle, rules) = decode_set_filter(msg)?;
            let handle = FifoHandle::from_raw(handle);
            let ret = ret_of(fabric.set_accept_filter(handle, &rules), |_| 0);
            encode_ret_ack_into(out, &header, ret)
        }
        CMD_READ_FRAME => {
            let handle = FifoHandle::from_raw(decode_handle_req(msg)?);
            match fabric.read_frame(handle) {
                Ok(frame) => encode_read_ack_classic_into(
                    out,
                    &header,
                    frame.is_some() as i32,
                    frame.as_ref(),
                ),
                Err(err) => encode_ret_ack_into(out, &header, err.to_ret()),
            }
        }
        CMD_READ_FD_FRAME => {
            let handle = FifoHandle::from_raw(decode_handle_req(msg)?);
            match fabric.read_fd_frame(handle) {
                Ok(frame) => encode_read_ack_fd_into(
                    out,
                    &header,
                    frame.is_some() as i32,
                    frame.as_ref(),
                ),
                Err(err) => encode_ret_ack_into(out, &header, err.to_ret()),
            }
        }
        CMD_READ_FRAMES => {
            let (handle, max) = decode_read_many(msg)?;
            let handle = FifoHandle::from_raw(handle);
            match fabric.read_frames(handle, clamp_batch(max)) {
                Ok(frames) => encode_read_many_ack_classic_into(out, &header, &frames),
                Err(err) => encode_ret_ack_into(out, &header, err.to_ret()),
            }
        }
        CMD_READ_FD_FRAMES => {
            let (handle, max) = decode_read_many(msg)?;
            let handle = FifoHandle::from_raw(handle);
            match fabric.read_fd_frames(handle, clamp_batch(max)) {
                Ok(frames) => encode_read_many_ack_fd_into(out, &header, &frames),
                Err(err) => encode_ret_ack_into(out, &header, err.to_ret()),
            }
        }
        CMD_WRITE_FRAME => {
            let (handle, frame) = decode_write_classic(msg)?;
            let handle = FifoHandle::from_raw(handle);
            encode_ret_ack_into(out, &header, ret_of(fabric.write_frame(handle, &frame), |_| 0))
        }
        CMD_WRITE_FD_FRAME => {
            let (handle, frame) = decode_write_fd(msg)?;
            let handle = FifoHandle::from_raw(handle);
            encode_ret_ack_into(
                out,
                &header,
                ret_of(fabric.write_fd_frame(handle, &frame), |_| 0),
            )
        }
        CMD_WRITE_FRAMES => {
            let (handle, frames) = decode_write_many_classic(msg)?;
            let handle = FifoHandle::from_raw(handle);
            let ret = ret_of(fabric.write_frames(handle, &frames), |count| count as i32);
            encode_ret_ack_into(out, &header, ret)
        }
        CMD_WRITE_FD_FRAMES => {
            let (handle, frames) = decode_write_many_fd(msg)?;
            let handle = FifoHandle::from_raw(handle);
            let ret = ret_of(fabric.write_fd_frames(handle, &frames), |count| count as i32);
            encode_ret_ack_into(out, &header, ret)
        }
        CMD_INSTALL_FAULT => {
            let req = decode_install_fault(msg)?;
            encode_ret_ack_into(out, &header, ret_of(fabric.install_fault(&req), |_| 0))
        }
        CMD_RESET_FAULT => {
            encode_ret_ack_into(out, &header, ret_of(fabric.reset_fault(), |_| 0))
        }
        _ => return Err("unknown command"),
    };
    Ok(Dispatch::Reply(len))
}

#[cfg(target_os = "linux")]
fn apply_realtime(cpu: Option<usize>, priority: Option<i32>) {
    unsafe {
        if let Some(cpu) = cpu {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                eprintln!(
                    "can-fabric-remote: pinning worker to cpu {cpu} failed: {}",
                    io::Error::last_os_error()
                );
            }
        }
        if let Some(priority) = priority {
            let param = libc::sched_param {
                sched_priority: priority,
            };
            if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
                eprintln!(
                    "can-fabric-remote: SCHED_FIFO priority {priority} unavailable: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_realtime(_cpu: Option<usize>, _priority: Option<i32>) {}
