//! # wlanprobe Wire Format
//!
//! Every datagram is exactly [`FRAME_LEN`] bytes, big-endian.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Magic (0x5750)        |    Version    |     Kind      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Instance ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Sequence (64-bit)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Send Timestamp (64-bit, µs)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Aux 0 (64-bit)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Aux 1 (64-bit)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! | Kind        | Sequence            | Aux 0                    | Aux 1              |
//! |-------------|---------------------|--------------------------|--------------------|
//! | Probe       | probe sequence      | 0                        | 0                  |
//! | Parity      | first seq of block  | XOR of send timestamps   | block length       |
//! | EchoRequest | echo id             | 0                        | 0                  |
//! | EchoReply   | echo id             | origin timestamp (t1)    | peer receive (t2)  |

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Frame magic ("WP").
pub const MAGIC: u16 = 0x5750;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of every wlanprobe datagram.
pub const FRAME_LEN: usize = 40;

// ─── Packet Kind ─────────────────────────────────────────────────────────────

/// Datagram discriminator carried in byte 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Probe = 0,
    Parity = 1,
    EchoRequest = 2,
    EchoReply = 3,
}

impl PacketKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PacketKind::Probe),
            1 => Some(PacketKind::Parity),
            2 => Some(PacketKind::EchoRequest),
            3 => Some(PacketKind::EchoReply),
            _ => None,
        }
    }
}

// ─── Probe Packet ────────────────────────────────────────────────────────────

/// Redundancy payload protecting one FEC block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redundancy {
    /// Number of probes in the protected block.
    pub block_len: u8,
    /// XOR of the send timestamps of every probe in the block.
    pub parity_us: u64,
}

/// A timestamped probe.
///
/// Plain probes carry no redundancy. Parity probes carry [`Redundancy`] and
/// reuse `sequence` for the first sequence number of the protected block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePacket {
    pub sequence: u64,
    /// Sender clock, µs.
    pub send_us: u64,
    pub redundancy: Option<Redundancy>,
}

impl ProbePacket {
    pub fn new(sequence: u64, send_us: u64) -> Self {
        ProbePacket {
            sequence,
            send_us,
            redundancy: None,
        }
    }

    pub fn parity(block_start: u64, send_us: u64, redundancy: Redundancy) -> Self {
        ProbePacket {
            sequence: block_start,
            send_us,
            redundancy: Some(redundancy),
        }
    }

    pub fn is_parity(&self) -> bool {
        self.redundancy.is_some()
    }
}

// ─── Echo Packets ────────────────────────────────────────────────────────────

/// Clock-sync request. `origin_us` is t1 on the requester's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRequest {
    pub echo_id: u64,
    pub origin_us: u64,
}

/// Clock-sync reply, stamped with the responder's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub echo_id: u64,
    /// t1: copied from the request.
    pub origin_us: u64,
    /// t2: responder receive time.
    pub receive_us: u64,
    /// t3: responder send time.
    pub transmit_us: u64,
}

// ─── Frame ───────────────────────────────────────────────────────────────────

/// Decoded datagram body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Probe(ProbePacket),
    EchoRequest(EchoRequest),
    EchoReply(EchoReply),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Probe(p) if p.is_parity() => PacketKind::Parity,
            Packet::Probe(_) => PacketKind::Probe,
            Packet::EchoRequest(_) => PacketKind::EchoRequest,
            Packet::EchoReply(_) => PacketKind::EchoReply,
        }
    }
}

/// A datagram: the sender's instance id plus its packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Random id chosen by each endpoint at startup.
    pub instance_id: u32,
    pub packet: Packet,
}

impl Frame {
    pub fn new(instance_id: u32, packet: Packet) -> Self {
        Frame {
            instance_id,
            packet,
        }
    }

    /// Serialize into a new buffer of exactly [`FRAME_LEN`] bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_LEN);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        let (sequence, timestamp, aux0, aux1) = match self.packet {
            Packet::Probe(p) => match p.redundancy {
                Some(r) => (p.sequence, p.send_us, r.parity_us, r.block_len as u64),
                None => (p.sequence, p.send_us, 0, 0),
            },
            Packet::EchoRequest(r) => (r.echo_id, r.origin_us, 0, 0),
            Packet::EchoReply(r) => (r.echo_id, r.transmit_us, r.origin_us, r.receive_us),
        };

        buf.put_u16(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.packet.kind() as u8);
        buf.put_u32(self.instance_id);
        buf.put_u64(sequence);
        buf.put_u64(timestamp);
        buf.put_u64(aux0);
        buf.put_u64(aux1);
    }

    /// Decode a datagram. Returns `None` for anything that is not a
    /// well-formed frame of exactly [`FRAME_LEN`] bytes.
    pub fn decode(mut buf: impl Buf) -> Option<Self> {
        if buf.remaining() != FRAME_LEN {
            return None;
        }
        if buf.get_u16() != MAGIC {
            return None;
        }
        if buf.get_u8() != PROTOCOL_VERSION {
            return None;
        }
        let kind = PacketKind::from_u8(buf.get_u8())?;
        let instance_id = buf.get_u32();
        let sequence = buf.get_u64();
        let timestamp = buf.get_u64();
        let aux0 = buf.get_u64();
        let aux1 = buf.get_u64();

        let packet = match kind {
            PacketKind::Probe => Packet::Probe(ProbePacket::new(sequence, timestamp)),
            PacketKind::Parity => {
                // Block length must fit the u8 field and protect at least one probe.
                if aux1 == 0 || aux1 > u8::MAX as u64 {
                    return None;
                }
                Packet::Probe(ProbePacket::parity(
                    sequence,
                    timestamp,
                    Redundancy {
                        block_len: aux1 as u8,
                        parity_us: aux0,
                    },
                ))
            }
            PacketKind::EchoRequest => Packet::EchoRequest(EchoRequest {
                echo_id: sequence,
                origin_us: timestamp,
            }),
            PacketKind::EchoReply => Packet::EchoReply(EchoReply {
                echo_id: sequence,
                origin_us: aux0,
                receive_us: aux1,
                transmit_us: timestamp,
            }),
        };

        Some(Frame {
            instance_id,
            packet,
        })
    }
}
