//! Packets, the unit of data moving through a pipeline.
//!
//! A packet carries optional `prefix` and `suffix` framing around its content.
//! Filters use the framing for things like chunk sizes and range boundaries so the
//! content itself is never copied. Only the content counts toward a queue's byte
//! count.
//!
//! A packet without content is *virtual*: it stands for `entity_length` bytes of a
//! file starting at `entity_pos`. Virtual packets are either transmitted by
//! reference by a connector that can do so, or filled with the file bytes by the
//! handler that produced them.

use bytes::{Buf, BytesMut};

use crate::utils::flags;

flags! {
    /// What a packet carries.
    pub struct PacketFlags: u8 {
        /// The response header block.
        const HEADER = 0x1;
        /// Body bytes.
        const DATA = 0x2;
        /// Body bytes belonging to a byte range response.
        const RANGE = 0x4;
        /// End of the message.
        const END = 0x8;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: PacketFlags,
    pub prefix: Option<BytesMut>,
    content: Option<BytesMut>,
    pub suffix: Option<BytesMut>,
    entity_pos: u64,
    entity_length: usize,
}

impl Packet {
    /// A data packet with room for `size` bytes.
    pub fn new(size: usize) -> Self {
        Self::with_content(PacketFlags::DATA, BytesMut::with_capacity(size))
    }

    /// A data packet holding a copy of `bytes`.
    pub fn data(bytes: &[u8]) -> Self {
        Self::with_content(PacketFlags::DATA, BytesMut::from(bytes))
    }

    /// A data packet taking ownership of `bytes`.
    pub fn from_bytes(bytes: BytesMut) -> Self {
        Self::with_content(PacketFlags::DATA, bytes)
    }

    /// The packet the transmitter serializes the response header block into.
    pub fn header() -> Self {
        Self::with_content(PacketFlags::HEADER, BytesMut::new())
    }

    /// Marks the end of a message. It has no content but may carry framing.
    pub fn end() -> Self {
        Self::with_content(PacketFlags::END, BytesMut::new())
    }

    /// A virtual packet standing for `len` bytes of a file starting at `pos`.
    pub fn entity(pos: u64, len: usize) -> Self {
        Self { flags: PacketFlags::DATA, prefix: None, content: None, suffix: None, entity_pos: pos, entity_length: len }
    }

    fn with_content(flags: PacketFlags, content: BytesMut) -> Self {
        Self { flags, prefix: None, content: Some(content), suffix: None, entity_pos: 0, entity_length: 0 }
    }

    pub fn is_header(&self) -> bool {
        self.flags.contains(PacketFlags::HEADER)
    }

    pub fn is_end(&self) -> bool {
        self.flags.contains(PacketFlags::END)
    }

    /// True for body packets, including range packets.
    pub fn is_data(&self) -> bool {
        self.flags.intersects(PacketFlags::DATA | PacketFlags::RANGE)
    }

    pub fn is_virtual(&self) -> bool {
        self.content.is_none()
    }

    /// Length of the content, or of the file region for a virtual packet.
    pub fn len(&self) -> usize {
        match &self.content {
            Some(content) => content.len(),
            None => self.entity_length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes this packet puts on the wire, framing included.
    pub fn wire_len(&self) -> usize {
        self.prefix.as_ref().map_or(0, BytesMut::len) + self.len() + self.suffix.as_ref().map_or(0, BytesMut::len)
    }

    pub fn content(&self) -> Option<&BytesMut> {
        self.content.as_ref()
    }

    pub fn content_mut(&mut self) -> Option<&mut BytesMut> {
        self.content.as_mut()
    }

    pub fn take_content(&mut self) -> Option<BytesMut> {
        self.content.take()
    }

    /// File offset of a virtual packet.
    pub fn entity_pos(&self) -> u64 {
        self.entity_pos
    }

    /// Replaces the file region of a virtual packet with the bytes read from it.
    pub fn fill(&mut self, bytes: BytesMut) {
        self.content = Some(bytes);
        self.entity_length = 0;
    }

    /// Splits the packet at `offset` and returns the tail.
    ///
    /// The tail keeps the flags and takes over the suffix. Returns `None` when
    /// `offset` is not inside the content, so a split never drops bytes.
    pub fn split(&mut self, offset: usize) -> Option<Packet> {
        if offset >= self.len() {
            return None;
        }
        let mut tail = match &mut self.content {
            Some(content) => Self::with_content(self.flags, content.split_off(offset)),
            None => {
                let tail = Self::entity(self.entity_pos + offset as u64, self.entity_length - offset);
                self.entity_length = offset;
                tail
            }
        };
        tail.flags = self.flags;
        tail.suffix = self.suffix.take();
        Some(tail)
    }

    /// Appends `other` to this packet, keeping the wire order of all framing.
    ///
    /// Virtual packets cannot be joined; `other` is handed back in that case.
    pub fn join(&mut self, other: Packet) -> Result<(), Packet> {
        let (Some(content), Some(other_content)) = (self.content.as_mut(), other.content.as_ref()) else {
            return Err(other);
        };
        if let Some(suffix) = self.suffix.take() {
            content.extend_from_slice(&suffix);
        }
        if let Some(prefix) = &other.prefix {
            content.extend_from_slice(prefix);
        }
        content.extend_from_slice(other_content);
        self.suffix = other.suffix;
        Ok(())
    }

    /// Drops the first `n` wire bytes after a partial write.
    ///
    /// Returns how many of them were content bytes.
    pub fn consume(&mut self, mut n: usize) -> usize {
        n -= consume_buf(&mut self.prefix, n);

        let from_content = n.min(self.len());
        match &mut self.content {
            Some(content) => content.advance(from_content),
            None => {
                self.entity_pos += from_content as u64;
                self.entity_length -= from_content;
            }
        }
        n -= from_content;

        consume_buf(&mut self.suffix, n);
        from_content
    }

    /// Drops the content, keeping flags and framing.
    pub(crate) fn clear_content(&mut self) {
        match &mut self.content {
            Some(content) => content.clear(),
            None => self.entity_length = 0,
        }
    }
}

fn consume_buf(buf: &mut Option<BytesMut>, n: usize) -> usize {
    let Some(bytes) = buf else {
        return 0;
    };
    let taken = n.min(bytes.len());
    bytes.advance(taken);
    if bytes.is_empty() {
        *buf = None;
    }
    taken
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wire_bytes(packet: &Packet) -> Vec<u8> {
        let mut bytes = Vec::new();
        for part in [&packet.prefix, &packet.content, &packet.suffix].into_iter().flatten() {
            bytes.extend_from_slice(part);
        }
        bytes
    }

    #[test]
    fn constructors_set_flags() {
        assert!(Packet::header().is_header());
        assert!(Packet::end().is_end());
        assert!(Packet::end().is_empty());
        assert!(Packet::new(16).is_data());

        let entity = Packet::entity(100, 50);
        assert!(entity.is_virtual());
        assert_eq!(entity.len(), 50);
        assert_eq!(entity.entity_pos(), 100);
    }

    #[test]
    fn split_moves_suffix_to_tail() {
        let mut packet = Packet::data(b"hello world");
        packet.prefix = Some(BytesMut::from("<"));
        packet.suffix = Some(BytesMut::from(">"));

        let tail = packet.split(5).unwrap();
        assert_eq!(&packet.content().unwrap()[..], b"hello");
        assert_eq!(packet.prefix.as_deref(), Some(&b"<"[..]));
        assert!(packet.suffix.is_none());
        assert_eq!(&tail.content().unwrap()[..], b" world");
        assert_eq!(tail.suffix.as_deref(), Some(&b">"[..]));
    }

    #[test]
    fn split_never_truncates() {
        let mut packet = Packet::data(b"abc");
        assert!(packet.split(3).is_none());
        assert!(packet.split(10).is_none());
        assert_eq!(packet.len(), 3);
    }

    #[test]
    fn split_virtual_packet() {
        let mut packet = Packet::entity(1000, 300);
        let tail = packet.split(100).unwrap();
        assert_eq!((packet.entity_pos(), packet.len()), (1000, 100));
        assert_eq!((tail.entity_pos(), tail.len()), (1100, 200));
        assert!(tail.is_virtual());
    }

    #[test]
    fn join_keeps_wire_order() {
        let mut first = Packet::data(b"ab");
        first.suffix = Some(BytesMut::from("|"));
        let mut second = Packet::data(b"cd");
        second.prefix = Some(BytesMut::from("#"));
        second.suffix = Some(BytesMut::from("$"));

        first.join(second).unwrap();
        assert_eq!(wire_bytes(&first), b"ab|#cd$");
        assert_eq!(first.suffix.as_deref(), Some(&b"$"[..]));
    }

    #[test]
    fn join_refuses_virtual() {
        let mut first = Packet::data(b"ab");
        let rejected = first.join(Packet::entity(0, 10)).unwrap_err();
        assert!(rejected.is_virtual());
    }

    #[test]
    fn consume_walks_prefix_content_suffix() {
        let mut packet = Packet::data(b"0123456789");
        packet.prefix = Some(BytesMut::from("\r\na\r\n"));
        packet.suffix = Some(BytesMut::from("!"));
        assert_eq!(packet.wire_len(), 16);

        assert_eq!(packet.consume(3), 0);
        assert_eq!(packet.consume(6), 4);
        assert_eq!(wire_bytes(&packet), b"456789!");
        assert_eq!(packet.consume(7), 6);
        assert_eq!(packet.wire_len(), 0);
    }

    proptest! {
        #[test]
        fn split_then_join_round_trips(content in proptest::collection::vec(any::<u8>(), 2..2048), at in any::<prop::sample::Index>()) {
            let k = 1 + at.index(content.len() - 1);
            let mut head = Packet::data(&content);
            let tail = head.split(k).unwrap();
            prop_assert_eq!(head.len() + tail.len(), content.len());

            head.join(tail).unwrap();
            prop_assert_eq!(&head.content().unwrap()[..], &content[..]);
        }
    }
}
