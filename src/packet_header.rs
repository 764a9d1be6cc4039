use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

/// Distinguishes payload-carrying packets from acknowledgments. Values other than
///  the two listed here fail to decode and cause the datagram to be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    Ack,
}

/// The fixed-order header at the start of every datagram.
///
/// For `Data` packets the header is followed by the fragment's payload bytes. For
///  `Ack` packets there is no payload: `message_id`, `fragment_index` and
///  `sequence_number` identify the acknowledged `Data` packet instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    /// Shared by all fragments of one logical message; unique per sender for the
    ///  lifetime of a transport instance.
    pub message_id: u64,
    pub fragment_index: u32,
    pub fragment_count: u32,
    /// Monotonically increasing per (sender, destination) for `Data` packets; used
    ///  for duplicate suppression and (in the ordered profile) delivery sequencing.
    pub sequence_number: u64,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 25;

    const FLAG_DATA: u8 = 0x01;
    const FLAG_ACK: u8 = 0x02;

    /// The ACK for a given `Data` packet: same coordinates, no payload.
    pub fn ack_for(data_header: &PacketHeader) -> PacketHeader {
        PacketHeader {
            kind: PacketKind::Ack,
            ..*data_header
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let flags = match self.kind {
            PacketKind::Data => Self::FLAG_DATA,
            PacketKind::Ack => Self::FLAG_ACK,
        };
        buf.put_u8(flags);
        buf.put_u64(self.message_id);
        buf.put_u32(self.fragment_index);
        buf.put_u32(self.fragment_count);
        buf.put_u64(self.sequence_number);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let kind = match buf.try_get_u8()? {
            Self::FLAG_DATA => PacketKind::Data,
            Self::FLAG_ACK => PacketKind::Ack,
            flags => bail!("unknown packet flags {:#04x}", flags),
        };
        let message_id = buf.try_get_u64()?;
        let fragment_index = buf.try_get_u32()?;
        let fragment_count = buf.try_get_u32()?;
        let sequence_number = buf.try_get_u64()?;

        if fragment_count == 0 {
            bail!("fragment count of zero");
        }
        if fragment_index >= fragment_count {
            bail!("fragment index {} out of range for count {}", fragment_index, fragment_count);
        }

        Ok(PacketHeader {
            kind,
            message_id,
            fragment_index,
            fragment_count,
            sequence_number,
        })
    }
}
