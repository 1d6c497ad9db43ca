//! Binary wire protocol, little-endian throughout.
//!
//! Every message starts with a 16-byte header whose first field is the total
//! message size, so a receiver can accumulate bytes until one message is
//! complete and several messages packed into one read can be walked by their
//! self-declared sizes. Requests and acknowledgements share the command
//! number; events flow server-to-client with no acknowledgement.
//!
//! Variable payloads (frame batches, filter rule lists) follow the fixed
//! body and are located by a byte offset measured from the start of the
//! message.

use can_fabric::{
    AcceptRule, CanFdFrame, CanFrame, FabricFrame, FaultRequest, FrameOrigin, FLAG_EXTENDED,
};
use embedded_can::Id;

pub const CMD_KILL_THREAD: u32 = 0;
pub const CMD_TERMINATE: u32 = 2;
pub const CMD_PING: u32 = 4;

pub const CMD_CREATE_FIFO: u32 = 200;
pub const CMD_DELETE_FIFO: u32 = 201;
pub const CMD_FLUSH_FIFO: u32 = 202;
pub const CMD_READ_FRAME: u32 = 203;
pub const CMD_READ_FRAMES: u32 = 204;
pub const CMD_WRITE_FRAMES: u32 = 205;
pub const CMD_SET_ACCEPT_FILTER: u32 = 206;
pub const CMD_WRITE_FRAME: u32 = 207;
pub const CMD_READ_FD_FRAME: u32 = 208;
pub const CMD_READ_FD_FRAMES: u32 = 209;
pub const CMD_WRITE_FD_FRAMES: u32 = 210;
pub const CMD_WRITE_FD_FRAME: u32 = 211;

pub const CMD_INSTALL_FAULT: u32 = 230;
pub const CMD_RESET_FAULT: u32 = 231;

/// Server-to-client cycle tick, event channel only.
pub const EVENT_CYCLE: u32 = 300;

pub const HEADER_LEN: usize = 16;
pub const CLASSIC_ELEM_LEN: usize = 32;
pub const FD_ELEM_LEN: usize = 88;
pub const RULE_ELEM_LEN: usize = 16;

/// Hard cap on frames per batch message.
pub const MAX_BATCH_FRAMES: usize = 1024;
/// Hard cap on one framed message; also the connection scratch buffer size.
pub const MAX_MSG_LEN: usize = 2 * 1024 * 1024;

const ELEM_DATA_OFFSET: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHeader {
    pub size: u32,
    pub command: u32,
    pub thread_id: u32,
    pub channel_number: u16,
    pub packet_counter: u16,
}

pub fn encode_header_into(buf: &mut [u8], header: &MsgHeader) {
    buf[0..4].copy_from_slice(&header.size.to_le_bytes());
    buf[4..8].copy_from_slice(&header.command.to_le_bytes());
    buf[8..12].copy_from_slice(&header.thread_id.to_le_bytes());
    buf[12..14].copy_from_slice(&header.channel_number.to_le_bytes());
    buf[14..16].copy_from_slice(&header.packet_counter.to_le_bytes());
}

pub fn decode_header(buf: &[u8]) -> Result<MsgHeader, &'static str> {
    if buf.len() < HEADER_LEN {
        return Err("short header");
    }
    let header = MsgHeader {
        size: read_u32(buf, 0)?,
        command: read_u32(buf, 4)?,
        thread_id: read_u32(buf, 8)?,
        channel_number: read_u16(buf, 12)?,
        packet_counter: read_u16(buf, 14)?,
    };
    if (header.size as usize) < HEADER_LEN || header.size as usize > MAX_MSG_LEN {
        return Err("message size out of range");
    }
    Ok(header)
}

fn read_u16(buf: &[u8], off: usize) -> Result<u16, &'static str> {
    let bytes = buf.get(off..off + 2).ok_or("truncated message")?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], off: usize) -> Result<u32, &'static str> {
    let bytes = buf.get(off..off + 4).ok_or("truncated message")?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i32(buf: &[u8], off: usize) -> Result<i32, &'static str> {
    Ok(read_u32(buf, off)? as i32)
}

fn read_u64(buf: &[u8], off: usize) -> Result<u64, &'static str> {
    let bytes = buf.get(off..off + 8).ok_or("truncated message")?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

// --- frame elements -------------------------------------------------------

fn elem_len<F: FabricFrame>() -> usize {
    ELEM_DATA_OFFSET + F::MAX_DATA
}

fn encode_elem_into<F: FabricFrame>(buf: &mut [u8], frame: &F) {
    let len = elem_len::<F>();
    for byte in buf[..len].iter_mut() {
        *byte = 0;
    }
    let ext = if matches!(frame.id(), Id::Extended(_)) {
        FLAG_EXTENDED
    } else {
        0
    };
    buf[0..4].copy_from_slice(&frame.id_raw().to_le_bytes());
    buf[4] = frame.dlc() as u8;
    buf[5] = (frame.flags() & !FLAG_EXTENDED) | ext;
    // buf[6] is a padding slot kept for layout stability.
    buf[7] = frame.channel();
    buf[8] = frame.origin().to_raw();
    buf[16..24].copy_from_slice(&frame.timestamp().to_le_bytes());
    buf[ELEM_DATA_OFFSET..ELEM_DATA_OFFSET + frame.dlc()].copy_from_slice(frame.data());
}

fn decode_elem<F: FabricFrame>(buf: &[u8]) -> Result<F, &'static str> {
    let len = elem_len::<F>();
    if buf.len() < len {
        return Err("truncated frame element");
    }
    let size = buf[4] as usize;
    if size > F::MAX_DATA {
        return Err("frame payload too long");
    }
    F::from_raw(
        read_u32(buf, 0)?,
        buf[5],
        buf[7],
        &buf[ELEM_DATA_OFFSET..ELEM_DATA_OFFSET + size],
        read_u64(buf, 16)?,
        FrameOrigin::from_raw(buf[8]),
    )
    .ok_or("identifier out of range")
}

pub fn encode_classic_elem_into(buf: &mut [u8], frame: &CanFrame) {
    encode_elem_into(buf, frame)
}

pub fn encode_fd_elem_into(buf: &mut [u8], frame: &CanFdFrame) {
    encode_elem_into(buf, frame)
}

pub fn decode_classic_elem(buf: &[u8]) -> Result<CanFrame, &'static str> {
    decode_elem(buf)
}

pub fn decode_fd_elem(buf: &[u8]) -> Result<CanFdFrame, &'static str> {
    decode_elem(buf)
}

// --- request builders (client side) ---------------------------------------

fn msg_with_body(command: u32, thread_id: u32, packet_counter: u16, body_len: usize) -> Vec<u8> {
    let total = HEADER_LEN + body_len;
    let mut msg = vec![0u8; total];
    encode_header_into(
        &mut msg,
        &MsgHeader {
            size: total as u32,
            command,
            thread_id,
            channel_number: 0,
            packet_counter,
        },
    );
    msg
}

pub fn encode_create_fifo(
    thread_id: u32,
    packet_counter: u16,
    depth: i32,
    fd: bool,
    policy_raw: i32,
) -> Vec<u8> {
    let mut msg = msg_with_body(CMD_CREATE_FIFO, thread_id, packet_counter, 8);
    let fd_flag = ((policy_raw as i16 as u16 as u32) << 16) | fd as u32;
    msg[16..20].copy_from_slice(&depth.to_le_bytes());
    msg[20..24].copy_from_slice(&fd_flag.to_le_bytes());
    msg
}

/// For commands whose body is just the fifo handle: delete, read-one.
pub fn encode_handle_req(
    command: u32,
    thread_id: u32,
    packet_counter: u16,
    handle: i32,
) -> Vec<u8> {
    let mut msg = msg_with_body(command, thread_id, packet_counter, 4);
    msg[16..20].copy_from_slice(&handle.to_le_bytes());
    msg
}

pub fn encode_flush(thread_id: u32, packet_counter: u16, handle: i32, flags: u32) -> Vec<u8> {
    let mut msg = msg_with_body(CMD_FLUSH_FIFO, thread_id, packet_counter, 8);
    msg[16..20].copy_from_slice(&handle.to_le_bytes());
    msg[20..24].copy_from_slice(&flags.to_le_bytes());
    msg
}

pub fn encode_read_many(
    command: u32,
    thread_id: u32,
    packet_counter: u16,
    handle: i32,
    max: i32,
) -> Vec<u8> {
    let mut msg = msg_with_body(command, thread_id, packet_counter, 8);
    msg[16..20].copy_from_slice(&handle.to_le_bytes());
    msg[20..24].copy_from_slice(&max.to_le_bytes());
    msg
}

fn encode_write_one<F: FabricFrame>(
    command: u32,
    thread_id: u32,
    packet_counter: u16,
    handle: i32,
    frame: &F,
) -> Vec<u8> {
    let mut msg = msg_with_body(command, thread_id, packet_counter, 4 + elem_len::<F>());
    msg[16..20].copy_from_slice(&handle.to_le_bytes());
    encode_elem_into(&mut msg[20..], frame);
    msg
}

pub fn encode_write_classic(
    thread_id: u32,
    packet_counter: u16,
    handle: i32,
    frame: &CanFrame,
) -> Vec<u8> {
    encode_write_one(CMD_WRITE_FRAME, thread_id, packet_counter, handle, frame)
}

pub fn encode_write_fd(
    thread_id: u32,
    packet_counter: u16,
    handle: i32,
    frame: &CanFdFrame,
) -> Vec<u8> {
    encode_write_one(CMD_WRITE_FD_FRAME, thread_id, packet_counter, handle, frame)
}

fn encode_write_many<F: FabricFrame>(
    command: u32,
    thread_id: u32,
    packet_counter: u16,
    handle: i32,
    frames: &[F],
) -> Vec<u8> {
    let elems_offset = HEADER_LEN + 12;
    let body_len = 12 + frames.len() * elem_len::<F>();
    let mut msg = msg_with_body(command, thread_id, packet_counter, body_len);
    msg[16..20].copy_from_slice(&handle.to_le_bytes());
    msg[20..24].copy_from_slice(&(frames.len() as i32).to_le_bytes());
    msg[24..28].copy_from_slice(&(elems_offset as u32).to_le_bytes());
    let mut at = elems_offset;
    for frame in frames {
        encode_elem_into(&mut msg[at..], frame);
        at += elem_len::<F>();
    }
    msg
}

pub fn encode_write_many_classic(
    thread_id: u32,
    packet_counter: u16,
    handle: i32,
    frames: &[CanFrame],
) -> Vec<u8> {
    encode_write_many(CMD_WRITE_FRAMES, thread_id, packet_counter, handle, frames)
}

pub fn encode_write_many_fd(
    thread_id: u32,
    packet_counter: u16,
    handle: i32,
    frames: &[CanFdFrame],
) -> Vec<u8> {
    encode_write_many(CMD_WRITE_FD_FRAMES, thread_id, packet_counter, handle, frames)
}

/// Encodes the rule list plus the terminating sentinel rule.
pub fn encode_set_filter(
    thread_id: u32,
    packet_counter: u16,
    handle: i32,
    rules: &[AcceptRule],
) -> Vec<u8> {
    let count = rules.len() + 1;
    let rules_offset = HEADER_LEN + 12;
    let body_len = 12 + count * RULE_ELEM_LEN;
    let mut msg = msg_with_body(CMD_SET_ACCEPT_FILTER, thread_id, packet_counter, body_len);
    msg[16..20].copy_from_slice(&handle.to_le_bytes());
    msg[20..24].copy_from_slice(&(count as i32).to_le_bytes());
    msg[24..28].copy_from_slice(&(rules_offset as u32).to_le_bytes());
    let mut at = rules_offset;
    for rule in rules.iter().chain(std::iter::once(&AcceptRule::SENTINEL)) {
        msg[at..at + 4].copy_from_slice(&rule.channel.to_le_bytes());
        msg[at + 4..at + 8].copy_from_slice(&rule.start_id.to_le_bytes());
        msg[at + 8..at + 12].copy_from_slice(&rule.stop_id.to_le_bytes());
        at += RULE_ELEM_LEN;
    }
    msg
}

pub fn encode_install_fault(thread_id: u32, packet_counter: u16, req: &FaultRequest) -> Vec<u8> {
    let mut msg = msg_with_body(CMD_INSTALL_FAULT, thread_id, packet_counter, 32);
    msg[16..20].copy_from_slice(&(req.channel as i32).to_le_bytes());
    msg[20..24].copy_from_slice(&req.id.to_le_bytes());
    msg[24..28].copy_from_slice(&req.start_bit.to_le_bytes());
    msg[28..32].copy_from_slice(&req.bit_size.to_le_bytes());
    msg[32..36].copy_from_slice(&(req.msb_first as u32).to_le_bytes());
    msg[36..40].copy_from_slice(&req.cycles.to_le_bytes());
    msg[40..48].copy_from_slice(&req.value.to_le_bytes());
    msg
}

/// Reset-fault, terminate and kill-thread carry no body.
pub fn encode_empty_req(command: u32, thread_id: u32, packet_counter: u16) -> Vec<u8> {
    msg_with_body(command, thread_id, packet_counter, 0)
}

pub fn encode_ping(thread_id: u32, packet_counter: u16, value: u32) -> Vec<u8> {
    let mut msg = msg_with_body(CMD_PING, thread_id, packet_counter, 4);
    msg[16..20].copy_from_slice(&value.to_le_bytes());
    msg
}

pub fn encode_cycle_event(cycle: u64) -> Vec<u8> {
    let mut msg = msg_with_body(EVENT_CYCLE, 0, 0, 8);
    msg[16..24].copy_from_slice(&cycle.to_le_bytes());
    msg
}

// --- request decoders (server side) ---------------------------------------

pub struct CreateFifoReq {
    pub depth: i32,
    pub fd: bool,
    pub policy_raw: i32,
}

pub fn decode_create_fifo(msg: &[u8]) -> Result<CreateFifoReq, &'static str> {
    let depth = read_i32(msg, 16)?;
    let fd_flag = read_u32(msg, 20)?;
    Ok(CreateFifoReq {
        depth,
        fd: fd_flag & 0xFFFF != 0,
        policy_raw: (fd_flag >> 16) as u16 as i16 as i32,
    })
}

pub fn decode_handle_req(msg: &[u8]) -> Result<i32, &'static str> {
    read_i32(msg, 16)
}

pub fn decode_flush(msg: &[u8]) -> Result<(i32, u32), &'static str> {
    Ok((read_i32(msg, 16)?, read_u32(msg, 20)?))
}

pub fn decode_read_many(msg: &[u8]) -> Result<(i32, i32), &'static str> {
    Ok((read_i32(msg, 16)?, read_i32(msg, 20)?))
}

fn decode_write_one<F: FabricFrame>(msg: &[u8]) -> Result<(i32, F), &'static str> {
    let handle = read_i32(msg, 16)?;
    let frame = decode_elem(msg.get(20..).ok_or("truncated message")?)?;
    Ok((handle, frame))
}

pub fn decode_write_classic(msg: &[u8]) -> Result<(i32, CanFrame), &'static str> {
    decode_write_one(msg)
}

pub fn decode_write_fd(msg: &[u8]) -> Result<(i32, CanFdFrame), &'static str> {
    decode_write_one(msg)
}

fn decode_write_many<F: FabricFrame>(msg: &[u8]) -> Result<(i32, Vec<F>), &'static str> {
    let handle = read_i32(msg, 16)?;
    let count = read_i32(msg, 20)?;
    let offset = read_u32(msg, 24)? as usize;
    if count < 0 || count as usize > MAX_BATCH_FRAMES {
        return Err("batch count out of range");
    }
    let mut frames = Vec::with_capacity(count as usize);
    let mut at = offset;
    for _ in 0..count {
        frames.push(decode_elem(msg.get(at..).ok_or("truncated batch")?)?);
        at += elem_len::<F>();
    }
    Ok((handle, frames))
}

pub fn decode_write_many_classic(msg: &[u8]) -> Result<(i32, Vec<CanFrame>), &'static str> {
    decode_write_many(msg)
}

pub fn decode_write_many_fd(msg: &[u8]) -> Result<(i32, Vec<CanFdFrame>), &'static str> {
    decode_write_many(msg)
}

/// Returns the rules up to (and excluding) the sentinel.
pub fn decode_set_filter(msg: &[u8]) -> Result<(i32, Vec<AcceptRule>), &'static str> {
    let handle = read_i32(msg, 16)?;
    let count = read_i32(msg, 20)?;
    let offset = read_u32(msg, 24)? as usize;
    if count < 1 || count as usize > MAX_BATCH_FRAMES {
        return Err("rule count out of range");
    }
    let mut rules = Vec::new();
    let mut at = offset;
    for _ in 0..count {
        let rule = AcceptRule {
            channel: read_i32(msg, at)?,
            start_id: read_u32(msg, at + 4)?,
            stop_id: read_u32(msg, at + 8)?,
        };
        if rule.is_sentinel() {
            return Ok((handle, rules));
        }
        rules.push(rule);
        at += RULE_ELEM_LEN;
    }
    Err("rule list lacks sentinel")
}

pub fn decode_install_fault(msg: &[u8]) -> Result<FaultRequest, &'static str> {
    Ok(FaultRequest {
        channel: read_i32(msg, 16)? as u8,
        id: read_u32(msg, 20)?,
        start_bit: read_i32(msg, 24)?,
        bit_size: read_i32(msg, 28)?,
        msb_first: read_u32(msg, 32)? != 0,
        cycles: read_u32(msg, 36)?,
        value: read_u64(msg, 40)?,
    })
}

pub fn decode_ping(msg: &[u8]) -> Result<u32, &'static str> {
    read_u32(msg, 16)
}

// --- acknowledgement encoders (server side) -------------------------------

fn start_reply(buf: &mut [u8], req: &MsgHeader, command: u32, total: usize) {
    encode_header_into(
        buf,
        &MsgHeader {
            size: total as u32,
            command,
            thread_id: req.thread_id,
            channel_number: req.channel_number,
            packet_counter: req.packet_counter,
        },
    );
}

pub fn encode_ret_ack_into(buf: &mut [u8], req: &MsgHeader, ret: i32) -> usize {
    let total = HEADER_LEN + 4;
    start_reply(buf, req, req.command, total);
    buf[16..20].copy_from_slice(&ret.to_le_bytes());
    total
}

fn encode_read_ack_into<F: FabricFrame>(
    buf: &mut [u8],
    req: &MsgHeader,
    ret: i32,
    frame: Option<&F>,
) -> usize {
    let total = HEADER_LEN + 4 + elem_len::<F>();
    start_reply(buf, req, req.command, total);
    buf[16..20].copy_from_slice(&ret.to_le_bytes());
    match frame {
        Some(frame) => encode_elem_into(&mut buf[20..], frame),
        None => buf[20..total].fill(0),
    }
    total
}

pub fn encode_read_ack_classic_into(
    buf: &mut [u8],
    req: &MsgHeader,
    ret: i32,
    frame: Option<&CanFrame>,
) -> usize {
    encode_read_ack_into(buf, req, ret, frame)
}

pub fn encode_read_ack_fd_into(
    buf: &mut [u8],
    req: &MsgHeader,
    ret: i32,
    frame: Option<&CanFdFrame>,
) -> usize {
    encode_read_ack_into(buf, req, ret, frame)
}

fn encode_read_many_ack_into<F: FabricFrame>(
    buf: &mut [u8],
    req: &MsgHeader,
    frames: &[F],
) -> usize {
    let elems_offset = HEADER_LEN + 8;
    let total = elems_offset + frames.len() * elem_len::<F>();
    start_reply(buf, req, req.command, total);
    buf[16..20].copy_from_slice(&(frames.len() as i32).to_le_bytes());
    buf[20..24].copy_from_slice(&(elems_offset as u32).to_le_bytes());
    let mut at = elems_offset;
    for frame in frames {
        encode_elem_into(&mut buf[at..], frame);
        at += elem_len::<F>();
    }
    total
}

pub fn encode_read_many_ack_classic_into(
    buf: &mut [u8],
    req: &MsgHeader,
    frames: &[CanFrame],
) -> usize {
    encode_read_many_ack_into(buf, req, frames)
}

pub fn encode_read_many_ack_fd_into(
    buf: &mut [u8],
    req: &MsgHeader,
    frames: &[CanFdFrame],
) -> usize {
    encode_read_many_ack_into(buf, req, frames)
}

pub fn encode_ping_ack_into(buf: &mut [u8], req: &MsgHeader, value: u32) -> usize {
    let total = HEADER_LEN + 8;
    start_reply(buf, req, req.command, total);
    buf[16..20].copy_from_slice(&0i32.to_le_bytes());
    buf[20..24].copy_from_slice(&value.to_le_bytes());
    total
}

// --- acknowledgement decoders (client side) -------------------------------

pub fn decode_ret_ack(msg: &[u8]) -> Result<i32, &'static str> {
    read_i32(msg, 16)
}

fn decode_read_ack<F: FabricFrame>(msg: &[u8]) -> Result<Option<F>, &'static str> {
    let ret = read_i32(msg, 16)?;
    match ret {
        1 => Ok(Some(decode_elem(
            msg.get(20..).ok_or("truncated message")?,
        )?)),
        0 => Ok(None),
        _ => Err("negative read acknowledgement"),
    }
}

pub fn decode_read_ack_classic(msg: &[u8]) -> Result<Option<CanFrame>, &'static str> {
    decode_read_ack(msg)
}

pub fn decode_read_ack_fd(msg: &[u8]) -> Result<Option<CanFdFrame>, &'static str> {
    decode_read_ack(msg)
}

fn decode_read_many_ack<F: FabricFrame>(msg: &[u8]) -> Result<Vec<F>, &'static str> {
    let ret = read_i32(msg, 16)?;
    if ret < 0 {
        return Err("negative read acknowledgement");
    }
    if ret as usize > MAX_BATCH_FRAMES {
        return Err("batch count out of range");
    }
    let offset = read_u32(msg, 20)? as usize;
    let mut frames = Vec::with_capacity(ret as usize);
    let mut at = offset;
    for _ in 0..ret {
        frames.push(decode_elem(msg.get(at..).ok_or("truncated batch")?)?);
        at += elem_len::<F>();
    }
    Ok(frames)
}

pub fn decode_read_many_ack_classic(msg: &[u8]) -> Result<Vec<CanFrame>, &'static str> {
    decode_read_many_ack(msg)
}

pub fn decode_read_many_ack_fd(msg: &[u8]) -> Result<Vec<CanFdFrame>, &'static str> {
    decode_read_many_ack(msg)
}

pub fn decode_ping_ack(msg: &[u8]) -> Result<u32, &'static str> {
    let ret = read_i32(msg, 16)?;
    if ret < 0 {
        return Err("ping refused");
    }
    read_u32(msg, 20)
}

pub fn decode_cycle_event(msg: &[u8]) -> Result<u64, &'static str> {
    read_u64(msg, 16)
}
