use can_fabric::{
    AcceptRule, CanFdFrame, CanFrame, FabricFrame, FaultRequest, FrameOrigin, FLAG_BRS,
    FLAG_EXTENDED, FLAG_FDF,
};
use can_fabric_remote::wire::{
    decode_classic_elem, decode_create_fifo, decode_cycle_event, decode_fd_elem, decode_flush,
    decode_handle_req, decode_header, decode_install_fault, decode_ping, decode_ping_ack,
    decode_read_ack_classic, decode_read_ack_fd, decode_read_many_ack_fd, decode_ret_ack,
    decode_set_filter, decode_write_many_classic, decode_write_many_fd, encode_classic_elem_into,
    encode_create_fifo, encode_cycle_event, encode_fd_elem_into, encode_flush, encode_handle_req,
    encode_install_fault, encode_ping, encode_ping_ack_into, encode_read_ack_classic_into,
    encode_read_ack_fd_into, encode_read_many_ack_fd_into, encode_ret_ack_into, encode_set_filter,
    encode_write_many_classic, encode_write_many_fd, CLASSIC_ELEM_LEN, CMD_DELETE_FIFO,
    FD_ELEM_LEN, HEADER_LEN, MAX_BATCH_FRAMES, MAX_MSG_LEN,
};

fn classic(id: u32, channel: u8, data: &[u8]) -> CanFrame {
    CanFrame::from_raw(id, 0, channel, data, 1234, FrameOrigin::Received).unwrap()
}

fn fd(id: u32, channel: u8, data: &[u8]) -> CanFdFrame {
    CanFdFrame::from_raw(
        id,
        FLAG_EXTENDED | FLAG_BRS | FLAG_FDF,
        channel,
        data,
        0xDEAD_BEEF_0000_0001,
        FrameOrigin::SelfTransmitted,
    )
    .unwrap()
}

#[test]
fn classic_element_layout_is_32_bytes() {
    let frame = classic(0x7FF, 3, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let mut buf = [0u8; CLASSIC_ELEM_LEN];
    encode_classic_elem_into(&mut buf, &frame);
    assert_eq!(&buf[0..4], &0x7FFu32.to_le_bytes());
    assert_eq!(buf[4], 8); // size
    assert_eq!(buf[7], 3); // channel
    assert_eq!(&buf[16..24], &1234u64.to_le_bytes());
    assert_eq!(&buf[24..32], &[1, 2, 3, 4, 5, 6, 7, 8]);

    let decoded = decode_classic_elem(&buf).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn fd_element_carries_full_payload() {
    let payload: Vec<u8> = (0..64u8).collect();
    let frame = fd(0x1FFF_FFFF, 7, &payload);
    let mut buf = [0u8; FD_ELEM_LEN];
    encode_fd_elem_into(&mut buf, &frame);
    assert_eq!(buf[4], 64);
    assert_eq!(buf[5], FLAG_EXTENDED | FLAG_BRS | FLAG_FDF);
    assert_eq!(buf[8], 1); // self-transmitted

    let decoded = decode_fd_elem(&buf).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn oversized_element_payload_is_rejected() {
    let frame = classic(0x1, 0, &[9; 8]);
    let mut buf = [0u8; CLASSIC_ELEM_LEN];
    encode_classic_elem_into(&mut buf, &frame);
    buf[4] = 9; // size byte beyond the classic payload
    assert!(decode_classic_elem(&buf).is_err());
}

#[test]
fn header_size_bounds_are_enforced() {
    let msg = encode_handle_req(CMD_DELETE_FIFO, 1, 1, 42);
    let header = decode_header(&msg).unwrap();
    assert_eq!(header.size as usize, msg.len());
    assert_eq!(header.command, CMD_DELETE_FIFO);
    assert_eq!(header.thread_id, 1);
    assert_eq!(header.packet_counter, 1);

    let mut bad = msg.clone();
    bad[0..4].copy_from_slice(&((MAX_MSG_LEN + 1) as u32).to_le_bytes());
    assert!(decode_header(&bad).is_err());
    bad[0..4].copy_from_slice(&4u32.to_le_bytes());
    assert!(decode_header(&bad).is_err());
}

#[test]
fn create_fifo_packs_policy_into_upper_bits() {
    let msg = encode_create_fifo(9, 2, 128, true, -1);
    let req = decode_create_fifo(&msg).unwrap();
    assert_eq!(req.depth, 128);
    assert!(req.fd);
    assert_eq!(req.policy_raw, -1);

    let msg = encode_create_fifo(9, 3, 16, false, 500);
    let req = decode_create_fifo(&msg).unwrap();
    assert!(!req.fd);
    assert_eq!(req.policy_raw, 500);
}

#[test]
fn flush_and_handle_roundtrip() {
    let msg = encode_flush(1, 1, -77, 0x3);
    assert_eq!(decode_flush(&msg).unwrap(), (-77, 0x3));

    let msg = encode_handle_req(CMD_DELETE_FIFO, 1, 1, 0x0102);
    assert_eq!(decode_handle_req(&msg).unwrap(), 0x0102);
}

#[test]
fn filter_rules_end_with_a_sentinel() {
    let rules = vec![
        AcceptRule {
            channel: 0,
            start_id: 0x100,
            stop_id: 0x200,
        },
        AcceptRule {
            channel: 5,
            start_id: 0,
            stop_id: u32::MAX,
        },
    ];
    let msg = encode_set_filter(4, 8, 33, &rules);
    let (handle, decoded) = decode_set_filter(&msg).unwrap();
    assert_eq!(handle, 33);
    assert_eq!(decoded, rules);

    // An empty list is just the sentinel.
    let msg = encode_set_filter(4, 9, 33, &[]);
    let (_, decoded) = decode_set_filter(&msg).unwrap();
    assert!(decoded.is_empty());
}

#[test]
fn batch_write_roundtrip_at_max_size() {
    let frames: Vec<CanFdFrame> = (0..MAX_BATCH_FRAMES)
        .map(|i| fd((i % 0x700) as u32 + 1, 0, &[(i & 0xFF) as u8; 64]))
        .collect();
    let msg = encode_write_many_fd(1, 1, 5, &frames);
    assert!(msg.len() <= MAX_MSG_LEN);
    let (handle, decoded) = decode_write_many_fd(&msg).unwrap();
    assert_eq!(handle, 5);
    assert_eq!(decoded.len(), MAX_BATCH_FRAMES);
    assert_eq!(decoded, frames);

    // One past the cap must be refused by the decoder.
    let mut oversized = msg.clone();
    oversized[20..24].copy_from_slice(&((MAX_BATCH_FRAMES + 1) as i32).to_le_bytes());
    assert!(decode_write_many_fd(&oversized).is_err());
}

#[test]
fn batch_write_classic_roundtrip() {
    let frames: Vec<CanFrame> = (1..=5)
        .map(|id| classic(id, 2, &[id as u8]))
        .collect();
    let msg = encode_write_many_classic(1, 1, 7, &frames);
    let (handle, decoded) = decode_write_many_classic(&msg).unwrap();
    assert_eq!(handle, 7);
    assert_eq!(decoded, frames);
}

#[test]
fn fault_request_roundtrip() {
    let req = FaultRequest {
        channel: 3,
        id: 0x1FF,
        start_bit: -2,
        bit_size: 17,
        msb_first: true,
        cycles: 1000,
        value: 0xFFFF_FFFF_FFFF_FFFF,
    };
    let msg = encode_install_fault(2, 2, &req);
    assert_eq!(decode_install_fault(&msg).unwrap(), req);
}

#[test]
fn read_ack_roundtrips() {
    let mut buf = vec![0u8; 4096];
    let req_header = decode_header(&encode_handle_req(203, 6, 1, 0)).unwrap();

    let frame = classic(0x42, 1, &[0xAB]);
    let len = encode_read_ack_classic_into(&mut buf, &req_header, 1, Some(&frame));
    assert_eq!(len, HEADER_LEN + 4 + CLASSIC_ELEM_LEN);
    assert_eq!(decode_ret_ack(&buf[..len]).unwrap(), 1);
    assert_eq!(decode_read_ack_classic(&buf[..len]).unwrap(), Some(frame));

    let len = encode_read_ack_classic_into(&mut buf, &req_header, 0, None);
    assert_eq!(decode_read_ack_classic(&buf[..len]).unwrap(), None);

    let wide = fd(0x42, 1, &[0xCD; 64]);
    let len = encode_read_ack_fd_into(&mut buf, &req_header, 1, Some(&wide));
    assert_eq!(decode_read_ack_fd(&buf[..len]).unwrap(), Some(wide));
}

#[test]
fn read_many_ack_roundtrip() {
    let mut buf = vec![0u8; MAX_MSG_LEN];
    let req_header = decode_header(&encode_handle_req(209, 6, 1, 0)).unwrap();
    let frames: Vec<CanFdFrame> = (1..=40).map(|id| fd(id, 4, &[id as u8; 48])).collect();
    let len = encode_read_many_ack_fd_into(&mut buf, &req_header, &frames);
    assert_eq!(decode_read_many_ack_fd(&buf[..len]).unwrap(), frames);
}

#[test]
fn ret_and_ping_acks() {
    let mut buf = [0u8; 64];
    let req_header = decode_header(&encode_ping(1, 1, 0x1234_5678)).unwrap();

    let len = encode_ret_ack_into(&mut buf, &req_header, -2);
    assert_eq!(decode_ret_ack(&buf[..len]).unwrap(), -2);

    assert_eq!(decode_ping(&encode_ping(1, 1, 0x1234_5678)).unwrap(), 0x1234_5678);
    let len = encode_ping_ack_into(&mut buf, &req_header, 0x1234_5678);
    assert_eq!(decode_ping_ack(&buf[..len]).unwrap(), 0x1234_5678);
}

#[test]
fn cycle_event_roundtrip() {
    let msg = encode_cycle_event(0xABCD_EF01_2345_6789);
    assert_eq!(decode_cycle_event(&msg).unwrap(), 0xABCD_EF01_2345_6789);
}

#[test]
fn truncated_messages_are_rejected() {
    let msg = encode_install_fault(1, 1, &FaultRequest {
        channel: 0,
        id: 1,
        start_bit: 0,
        bit_size: 8,
        msb_first: false,
        cycles: 1,
        value: 0,
    });
    assert!(decode_install_fault(&msg[..msg.len() - 1]).is_err());

    let msg = encode_create_fifo(1, 1, 4, false, 0);
    assert!(decode_create_fifo(&msg[..18]).is_err());
}
