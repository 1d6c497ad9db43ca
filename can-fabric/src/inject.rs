//! Single-descriptor fault injection at the bus crossing.
//!
//! One fault at a time, process wide. A fault targets one (channel, id)
//! pair, lives for a bounded number of simulation cycles, and either
//! rewrites payload bits, replaces the payload length, or suppresses
//! transmission entirely. When the cycle budget runs out the descriptor
//! clears itself and publishes zero through the status sink.

use crate::frame::FabricFrame;
use crate::seams::StatusSink;
use std::sync::Mutex;

const MASK_BYTES: usize = 64;

/// A fault installation request, as carried on the wire.
///
/// `start_bit` selects the action: `-1` replaces the payload length with
/// `clamp(bit_size, 0, 64)` bytes, `-2` suspends transmission, anything
/// else overwrites `bit_size` bits starting at `start_bit` with `value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRequest {
    pub channel: u8,
    pub id: u32,
    pub start_bit: i32,
    pub bit_size: i32,
    pub msb_first: bool,
    pub cycles: u32,
    pub value: u64,
}

/// What an installed fault does to a matching frame.
#[derive(Clone)]
pub enum FaultAction {
    Overwrite {
        and_mask: Box<[u8; MASK_BYTES]>,
        or_mask: Box<[u8; MASK_BYTES]>,
        msb_first: bool,
    },
    ChangeLength {
        dlc: usize,
    },
    Suspend,
}

impl FaultAction {
    fn from_request(req: &FaultRequest) -> Self {
        match req.start_bit {
            -1 => FaultAction::ChangeLength {
                dlc: req.bit_size.clamp(0, 64) as usize,
            },
            -2 => FaultAction::Suspend,
            _ => {
                let (and_mask, or_mask) =
                    build_masks(req.start_bit.max(0) as usize, req.bit_size.max(0) as usize, req.value);
                FaultAction::Overwrite {
                    and_mask: Box::new(and_mask),
                    or_mask: Box::new(or_mask),
                    msb_first: req.msb_first,
                }
            }
        }
    }
}

/// AND/OR byte masks covering `bit_size` bits of `value` placed at
/// `start_bit`. Untouched bits keep AND=1/OR=0 so they pass through.
fn build_masks(start_bit: usize, bit_size: usize, value: u64) -> ([u8; MASK_BYTES], [u8; MASK_BYTES]) {
    let mut and_mask = [0xFFu8; MASK_BYTES];
    let mut or_mask = [0u8; MASK_BYTES];
    let end = (start_bit + bit_size.min(64)).min(MASK_BYTES * 8);
    for bit in start_bit..end {
        let byte = bit / 8;
        let pos = bit % 8;
        and_mask[byte] &= !(1 << pos);
        if (value >> (bit - start_bit)) & 1 != 0 {
            or_mask[byte] |= 1 << pos;
        }
    }
    (and_mask, or_mask)
}

/// Verdict of the crossing hook for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrossingVerdict {
    /// Forward the (possibly modified) frame.
    Pass,
    /// Drop the frame without forwarding it.
    Suppress,
}

struct ActiveFault {
    channel: u8,
    id: u32,
    action: FaultAction,
    install_cycle: u64,
    cycles: u32,
}

/// The process-wide injector. Owned by a [`Fabric`](crate::Fabric), never a
/// global.
#[derive(Default)]
pub struct ErrorInjector {
    state: Mutex<Option<ActiveFault>>,
}

impl ErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fault, replacing any active one.
    pub fn install(&self, req: &FaultRequest, now: u64, status: &dyn StatusSink) {
        let fault = ActiveFault {
            channel: req.channel,
            id: req.id,
            action: FaultAction::from_request(req),
            install_cycle: now,
            cycles: req.cycles,
        };
        if let Ok(mut state) = self.state.lock() {
            *state = Some(fault);
        }
        status.publish_fault_active(true);
    }

    pub fn reset(&self, status: &dyn StatusSink) {
        if let Ok(mut state) = self.state.lock() {
            *state = None;
        }
        status.publish_fault_active(false);
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Apply the active fault to a frame crossing the bus at cycle `now`.
    pub fn apply<F: FabricFrame>(
        &self,
        frame: &mut F,
        now: u64,
        status: &dyn StatusSink,
    ) -> CrossingVerdict {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return CrossingVerdict::Pass,
        };
        let Some(fault) = state.as_ref() else {
            return CrossingVerdict::Pass;
        };
        if fault.install_cycle + fault.cycles as u64 <= now {
            *state = None;
            drop(state);
            status.publish_fault_active(false);
            return CrossingVerdict::Pass;
        }
        if fault.channel != frame.channel() || fault.id != frame.id_raw() {
            return CrossingVerdict::Pass;
        }
        match &fault.action {
            FaultAction::Overwrite {
                and_mask,
                or_mask,
                msb_first,
            } => {
                let dlc = frame.dlc();
                let data = frame.data_mut();
                for i in 0..dlc {
                    let mi = if *msb_first { dlc - 1 - i } else { i };
                    data[i] = (data[i] & and_mask[mi]) | or_mask[mi];
                }
                CrossingVerdict::Pass
            }
            FaultAction::ChangeLength { dlc } => {
                // Keeps the original length when the new one does not fit
                // the frame shape.
                let _ = frame.set_dlc(*dlc);
                CrossingVerdict::Pass
            }
            FaultAction::Suspend => CrossingVerdict::Suppress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CanFdFrame, CanFrame, FrameOrigin};
    use crate::seams::NullStatusSink;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct RecordingSink(AtomicI32);

    impl StatusSink for RecordingSink {
        fn publish_fault_active(&self, active: bool) {
            self.0.store(active as i32, Ordering::Relaxed);
        }
    }

    fn overwrite_req(channel: u8, id: u32, value: u64) -> FaultRequest {
        FaultRequest {
            channel,
            id,
            start_bit: 0,
            bit_size: 8,
            msb_first: false,
            cycles: 10,
            value,
        }
    }

    #[test]
    fn overwrites_only_matching_frames() {
        let injector = ErrorInjector::new();
        injector.install(&overwrite_req(0, 0x100, 0xAA), 0, &NullStatusSink);

        let mut hit =
            CanFrame::from_raw(0x100, 0, 0, &[0x11, 0x22], 0, FrameOrigin::Received).unwrap();
        assert_eq!(
            injector.apply(&mut hit, 1, &NullStatusSink),
            CrossingVerdict::Pass
        );
        assert_eq!(hit.data(), &[0xAA, 0x22]);

        let mut miss =
            CanFrame::from_raw(0x101, 0, 0, &[0x11, 0x22], 0, FrameOrigin::Received).unwrap();
        injector.apply(&mut miss, 1, &NullStatusSink);
        assert_eq!(miss.data(), &[0x11, 0x22]);

        let mut other_channel =
            CanFrame::from_raw(0x100, 0, 1, &[0x11], 0, FrameOrigin::Received).unwrap();
        injector.apply(&mut other_channel, 1, &NullStatusSink);
        assert_eq!(other_channel.data(), &[0x11]);
    }

    #[test]
    fn unaligned_overwrite_spans_bytes() {
        let injector = ErrorInjector::new();
        let req = FaultRequest {
            channel: 0,
            id: 0x1,
            start_bit: 4,
            bit_size: 8,
            msb_first: false,
            cycles: 5,
            value: 0xFF,
        };
        injector.install(&req, 0, &NullStatusSink);
        let mut frame =
            CanFrame::from_raw(0x1, 0, 0, &[0x00, 0x00], 0, FrameOrigin::Received).unwrap();
        injector.apply(&mut frame, 1, &NullStatusSink);
        assert_eq!(frame.data(), &[0xF0, 0x0F]);
    }

    #[test]
    fn msb_first_reverses_mask_index() {
        let injector = ErrorInjector::new();
        let mut req = overwrite_req(0, 0x1, 0xAA);
        req.msb_first = true;
        injector.install(&req, 0, &NullStatusSink);
        let mut frame =
            CanFrame::from_raw(0x1, 0, 0, &[0x00, 0x00], 0, FrameOrigin::Received).unwrap();
        injector.apply(&mut frame, 1, &NullStatusSink);
        // Mask byte 0 lands on the last payload byte.
        assert_eq!(frame.data(), &[0x00, 0xAA]);
    }

    #[test]
    fn change_length_clamps() {
        let injector = ErrorInjector::new();
        let req = FaultRequest {
            channel: 0,
            id: 0x1,
            start_bit: -1,
            bit_size: 100,
            msb_first: false,
            cycles: 5,
            value: 0,
        };
        injector.install(&req, 0, &NullStatusSink);
        let mut fd =
            CanFdFrame::from_raw(0x1, 0, 0, &[1; 8], 0, FrameOrigin::Received).unwrap();
        injector.apply(&mut fd, 1, &NullStatusSink);
        assert_eq!(fd.dlc(), 64);

        // Classic frames cannot grow past 8 bytes; length stays put.
        let mut classic =
            CanFrame::from_raw(0x1, 0, 0, &[1; 4], 0, FrameOrigin::Received).unwrap();
        injector.apply(&mut classic, 1, &NullStatusSink);
        assert_eq!(classic.dlc(), 4);
    }

    #[test]
    fn suspend_drops_matching_frames() {
        let injector = ErrorInjector::new();
        let req = FaultRequest {
            channel: 2,
            id: 0x42,
            start_bit: -2,
            bit_size: 0,
            msb_first: false,
            cycles: 3,
            value: 0,
        };
        injector.install(&req, 0, &NullStatusSink);
        let mut frame =
            CanFrame::from_raw(0x42, 0, 2, &[9], 0, FrameOrigin::Received).unwrap();
        assert_eq!(
            injector.apply(&mut frame, 1, &NullStatusSink),
            CrossingVerdict::Suppress
        );
    }

    #[test]
    fn budget_expiry_clears_and_publishes_zero() {
        let sink = RecordingSink(AtomicI32::new(-1));
        let injector = ErrorInjector::new();
        injector.install(&overwrite_req(0, 0x100, 0xAA), 5, &sink);
        assert_eq!(sink.0.load(Ordering::Relaxed), 1);

        let mut frame =
            CanFrame::from_raw(0x100, 0, 0, &[0x00], 0, FrameOrigin::Received).unwrap();
        // Cycle 14 is inside the 10-cycle budget starting at 5.
        injector.apply(&mut frame, 14, &sink);
        assert_eq!(frame.data(), &[0xAA]);

        // Cycle 15 is past it: fault expires, frame passes untouched.
        let mut late =
            CanFrame::from_raw(0x100, 0, 0, &[0x00], 0, FrameOrigin::Received).unwrap();
        injector.apply(&mut late, 15, &sink);
        assert_eq!(late.data(), &[0x00]);
        assert_eq!(sink.0.load(Ordering::Relaxed), 0);
        assert!(!injector.is_active());
    }

    #[test]
    fn reset_publishes_zero() {
        let sink = RecordingSink(AtomicI32::new(-1));
        let injector = ErrorInjector::new();
        injector.install(&overwrite_req(0, 1, 0), 0, &sink);
        injector.reset(&sink);
        assert!(!injector.is_active());
        assert_eq!(sink.0.load(Ordering::Relaxed), 0);
    }
}
