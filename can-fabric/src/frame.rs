use embedded_can::{ExtendedId, Frame as EmbeddedFrame, Id, StandardId};

/// Tag bit: the identifier is 29-bit extended.
pub const FLAG_EXTENDED: u8 = 1 << 0;
/// Tag bit: bit-rate switch requested (CAN FD).
pub const FLAG_BRS: u8 = 1 << 1;
/// Tag bit: FD frame format.
pub const FLAG_FDF: u8 = 1 << 2;

const FLAG_MASK: u8 = FLAG_EXTENDED | FLAG_BRS | FLAG_FDF;

/// Which side of the fabric produced a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameOrigin {
    /// Arrived from the bus side (external ingress).
    #[default]
    Received,
    /// Looped back from another node's transmit ring.
    SelfTransmitted,
}

impl FrameOrigin {
    pub fn to_raw(self) -> u8 {
        match self {
            FrameOrigin::Received => 0,
            FrameOrigin::SelfTransmitted => 1,
        }
    }

    pub fn from_raw(raw: u8) -> Self {
        if raw == 0 {
            FrameOrigin::Received
        } else {
            FrameOrigin::SelfTransmitted
        }
    }
}

fn id_from_raw(raw: u32, extended: bool) -> Option<Id> {
    if extended {
        ExtendedId::new(raw).map(Id::Extended)
    } else {
        StandardId::new(raw.try_into().ok()?).map(Id::Standard)
    }
}

fn id_to_raw(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw(),
    }
}

/// Behavior shared by the classic and FD frame shapes stored in fifo rings.
pub trait FabricFrame: Copy + Default {
    /// Payload capacity in bytes.
    const MAX_DATA: usize;

    /// Build a frame from raw wire fields. `None` when the identifier is out
    /// of range for its format or the payload does not fit.
    fn from_raw(
        id_raw: u32,
        flags: u8,
        channel: u8,
        data: &[u8],
        timestamp: u64,
        origin: FrameOrigin,
    ) -> Option<Self>;

    fn id(&self) -> Id;
    fn id_raw(&self) -> u32;
    /// Tag bits (`FLAG_EXTENDED` | `FLAG_BRS` | `FLAG_FDF`).
    fn flags(&self) -> u8;
    fn channel(&self) -> u8;
    fn dlc(&self) -> usize;
    fn data(&self) -> &[u8];
    fn timestamp(&self) -> u64;
    fn origin(&self) -> FrameOrigin;

    fn data_mut(&mut self) -> &mut [u8];
    /// Resize the payload length. `false` when `dlc` exceeds the capacity.
    fn set_dlc(&mut self, dlc: usize) -> bool;
    fn set_timestamp(&mut self, timestamp: u64);
    fn set_origin(&mut self, origin: FrameOrigin);
}

macro_rules! fabric_frame {
    ($name:ident, $max:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name {
            id: Id,
            data: [u8; $max],
            dlc: u8,
            flags: u8,
            channel: u8,
            origin: FrameOrigin,
            timestamp: u64,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    id: Id::Standard(StandardId::ZERO),
                    data: [0u8; $max],
                    dlc: 0,
                    flags: 0,
                    channel: 0,
                    origin: FrameOrigin::Received,
                    timestamp: 0,
                }
            }
        }

        impl $name {
            /// Build a frame bound to a channel with default tag bits.
            pub fn new_on_channel(id: impl Into<Id>, channel: u8, data: &[u8]) -> Option<Self> {
                let mut frame = <Self as EmbeddedFrame>::new(id, data)?;
                frame.channel = channel;
                Some(frame)
            }

            /// Returns the CAN identifier for this frame.
            pub fn id(&self) -> Id {
                self.id
            }

            pub fn dlc(&self) -> usize {
                self.dlc as usize
            }

            pub fn data(&self) -> &[u8] {
                &self.data[..self.dlc as usize]
            }

            pub fn with_flags(mut self, flags: u8) -> Self {
                self.flags = (flags & FLAG_MASK & !FLAG_EXTENDED) | (self.flags & FLAG_EXTENDED);
                self
            }
        }

        impl FabricFrame for $name {
            const MAX_DATA: usize = $max;

            fn from_raw(
                id_raw: u32,
                flags: u8,
                channel: u8,
                data: &[u8],
                timestamp: u64,
                origin: FrameOrigin,
            ) -> Option<Self> {
                if data.len() > $max {
                    return None;
                }
                let id = id_from_raw(id_raw, flags & FLAG_EXTENDED != 0)?;
                let mut buf = [0u8; $max];
                buf[..data.len()].copy_from_slice(data);
                Some(Self {
                    id,
                    data: buf,
                    dlc: data.len() as u8,
                    flags: flags & FLAG_MASK,
                    channel,
                    origin,
                    timestamp,
                })
            }

            fn id(&self) -> Id {
                self.id
            }

            fn id_raw(&self) -> u32 {
                id_to_raw(self.id)
            }

            fn flags(&self) -> u8 {
                self.flags
            }

            fn channel(&self) -> u8 {
                self.channel
            }

            fn dlc(&self) -> usize {
                self.dlc as usize
            }

            fn data(&self) -> &[u8] {
                &self.data[..self.dlc as usize]
            }

            fn timestamp(&self) -> u64 {
                self.timestamp
            }

            fn origin(&self) -> FrameOrigin {
                self.origin
            }

            fn data_mut(&mut self) -> &mut [u8] {
                let dlc = self.dlc as usize;
                &mut self.data[..dlc]
            }

            fn set_dlc(&mut self, dlc: usize) -> bool {
                if dlc > $max {
                    return false;
                }
                self.dlc = dlc as u8;
                true
            }

            fn set_timestamp(&mut self, timestamp: u64) {
                self.timestamp = timestamp;
            }

            fn set_origin(&mut self, origin: FrameOrigin) {
                self.origin = origin;
            }
        }

        impl EmbeddedFrame for $name {
            fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
                if data.len() > $max {
                    return None;
                }
                let id = id.into();
                let mut buf = [0u8; $max];
                buf[..data.len()].copy_from_slice(data);
                let ext = if matches!(id, Id::Extended(_)) {
                    FLAG_EXTENDED
                } else {
                    0
                };
                Some(Self {
                    id,
                    data: buf,
                    dlc: data.len() as u8,
                    flags: ext,
                    channel: 0,
                    origin: FrameOrigin::Received,
                    timestamp: 0,
                })
            }

            // Remote frames are not modeled on the fabric.
            fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
                None
            }

            fn is_extended(&self) -> bool {
                matches!(self.id, Id::Extended(_))
            }

            fn is_remote_frame(&self) -> bool {
                false
            }

            fn id(&self) -> Id {
                self.id
            }

            fn dlc(&self) -> usize {
                self.dlc as usize
            }

            fn data(&self) -> &[u8] {
                &self.data[..self.dlc as usize]
            }
        }
    };
}

fabric_frame!(CanFrame, 8, "A classic CAN frame with up to 8 payload bytes.");
fabric_frame!(CanFdFrame, 64, "A CAN FD frame with up to 64 payload bytes.");

impl CanFdFrame {
    /// Widen a classic frame, keeping channel, tag bits and timestamp.
    pub fn from_classic(frame: &CanFrame) -> Self {
        let mut fd = CanFdFrame::from_raw(
            frame.id_raw(),
            frame.flags(),
            frame.channel(),
            frame.data(),
            frame.timestamp(),
            frame.origin(),
        )
        .unwrap_or_default();
        fd.id = frame.id;
        fd
    }
}

impl CanFrame {
    /// Narrow an FD frame to the classic shape. The second value is true
    /// when the payload was longer than 8 bytes and had to be truncated.
    pub fn from_fd(frame: &CanFdFrame) -> (Self, bool) {
        let truncated = frame.dlc() > CanFrame::MAX_DATA;
        let take = frame.dlc().min(CanFrame::MAX_DATA);
        let mut classic = CanFrame::default();
        classic.id = frame.id;
        classic.flags = frame.flags();
        classic.channel = frame.channel();
        classic.origin = frame.origin();
        classic.timestamp = frame.timestamp();
        classic.data[..take].copy_from_slice(&frame.data()[..take]);
        classic.dlc = take as u8;
        (classic, truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip_keeps_fields() {
        let frame = CanFrame::from_raw(
            0x1FF,
            FLAG_EXTENDED,
            3,
            &[1, 2, 3],
            77,
            FrameOrigin::SelfTransmitted,
        )
        .unwrap();
        assert_eq!(frame.id_raw(), 0x1FF);
        assert!(matches!(frame.id(), Id::Extended(_)));
        assert_eq!(frame.channel(), 3);
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.timestamp(), 77);
        assert_eq!(frame.origin(), FrameOrigin::SelfTransmitted);
    }

    #[test]
    fn standard_id_range_checked() {
        assert!(CanFrame::from_raw(0x800, 0, 0, &[], 0, FrameOrigin::Received).is_none());
        assert!(CanFrame::from_raw(0x7FF, 0, 0, &[], 0, FrameOrigin::Received).is_some());
    }

    #[test]
    fn narrowing_truncates_and_reports() {
        let fd = CanFdFrame::from_raw(0x10, 0, 1, &[9; 12], 0, FrameOrigin::Received).unwrap();
        let (classic, truncated) = CanFrame::from_fd(&fd);
        assert!(truncated);
        assert_eq!(classic.dlc(), 8);
        assert_eq!(classic.data(), &[9; 8]);

        let short = CanFdFrame::from_raw(0x10, 0, 1, &[5; 4], 0, FrameOrigin::Received).unwrap();
        let (classic, truncated) = CanFrame::from_fd(&short);
        assert!(!truncated);
        assert_eq!(classic.data(), &[5; 4]);
    }

    #[test]
    fn widening_is_lossless() {
        let classic =
            CanFrame::from_raw(0x123, FLAG_BRS, 2, &[1, 2], 42, FrameOrigin::Received).unwrap();
        let fd = CanFdFrame::from_classic(&classic);
        assert_eq!(fd.id_raw(), 0x123);
        assert_eq!(fd.flags(), FLAG_BRS);
        assert_eq!(fd.channel(), 2);
        assert_eq!(fd.data(), &[1, 2]);
        assert_eq!(fd.timestamp(), 42);
    }
}
