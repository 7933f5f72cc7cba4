use bytes::Bytes;
use ffmpeg_next::Rational;

use crate::frame::Ticket;

pub type PacketSender = tokio::sync::broadcast::Sender<PacketElement>;
pub type PacketReceiver = tokio::sync::broadcast::Receiver<PacketElement>;

#[derive(Clone)]
pub enum PacketCmd {
    Data(RawPacket),
    /// The stream reached a seek/rewind point; buffered decoder output must be flushed.
    Loop,
    Eof,
}

/// One element on the shared upstream channel, addressed to a single stream.
#[derive(Clone)]
pub struct PacketElement {
    pub stream: usize,
    pub cmd: PacketCmd,
    pub ticket: Ticket,
}

impl PacketElement {
    pub fn data(packet: RawPacket, ticket: Ticket) -> Self {
        Self {
            stream: packet.index(),
            cmd: PacketCmd::Data(packet),
            ticket,
        }
    }

    pub fn looped(stream: usize) -> Self {
        Self {
            stream,
            cmd: PacketCmd::Loop,
            ticket: Ticket::default(),
        }
    }

    pub fn eof(stream: usize) -> Self {
        Self {
            stream,
            cmd: PacketCmd::Eof,
            ticket: Ticket::default(),
        }
    }

    pub fn stream_index(&self) -> usize {
        self.stream
    }
}

#[derive(Clone)]
pub struct RawPacket {
    packet: ffmpeg_next::codec::packet::Packet,
    time_base: Rational,
}

impl RawPacket {
    /// Wraps a copy of `data` as a packet of `stream`. Mostly useful for synthetic sources.
    pub fn from_data(stream: usize, data: &[u8], time_base: Rational) -> Self {
        let mut packet = ffmpeg_next::codec::packet::Packet::copy(data);
        packet.set_stream(stream);
        Self { packet, time_base }
    }

    pub fn index(&self) -> usize {
        self.packet.stream()
    }

    pub fn data(&self) -> Bytes {
        self.packet
            .data()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn get_mut(&mut self) -> &mut ffmpeg_next::codec::packet::Packet {
        &mut self.packet
    }

}

impl From<(ffmpeg_next::codec::packet::Packet, Rational)> for RawPacket {
    fn from((packet, time_base): (ffmpeg_next::codec::packet::Packet, Rational)) -> Self {
        Self { packet, time_base }
    }
}
