use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{ABORT_DELAY, MAX_DELAY, MIN_DELAY, SKIP_DELAY};
use crate::document::{format_hex, Document, NodeKind};
use crate::error::DocumentError;
use crate::session::HexBytes;

/// One packet on the wire followed by the pause the sender takes after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketData {
    pub data: HexBytes,
    /// Milliseconds.
    pub delay: u32,
}

impl PacketData {
    pub fn new(data: Vec<u8>, delay: u32) -> Self {
        Self {
            data: HexBytes(data),
            delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestCase {
    pub packets: Vec<PacketData>,
}

impl TestCase {
    /// Assembles every Packet under the root, depth first, in document order.
    pub fn from_document(doc: &Document) -> Result<Self, DocumentError> {
        let mut packets = Vec::new();
        for (i, packet) in doc.root().children.iter().enumerate() {
            if packet.kind != NodeKind::Packet {
                continue;
            }
            let delay = effective_delay(packet.base_delay()?.saturating_add(packet.diff()));
            packets.push(PacketData::new(doc.assemble(&[i])?, delay));
        }
        Ok(Self { packets })
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, packet) in self.packets.iter().enumerate() {
            writeln!(f, "Data {i}: {} (delay {} ms)", format_hex(&packet.data), packet.delay)?;
        }
        Ok(())
    }
}

/// Clamps a delay into the working envelope, keeping the two sentinels.
fn effective_delay(delay: i64) -> u32 {
    if delay == i64::from(SKIP_DELAY) || delay == i64::from(ABORT_DELAY) {
        return delay as u32;
    }
    delay.clamp(i64::from(MIN_DELAY), i64::from(MAX_DELAY)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_one_entry_per_packet() {
        let doc = Document::parse(
            r#"<Sequence>
                 <Packet delay="64 00"><Data value="41 42"/></Packet>
                 <Packet delay="e8 03" diff="-5">
                   <Block><Data value="01"/><Size value="00 02"/></Block>
                   <Checksum value="ff"/>
                 </Packet>
               </Sequence>"#,
        )
        .unwrap();
        let case = TestCase::from_document(&doc).unwrap();
        assert_eq!(case.len(), 2);
        assert_eq!(case.packets[0], PacketData::new(vec![0x41, 0x42], 100));
        assert_eq!(case.packets[1], PacketData::new(vec![0x01, 0x00, 0x02], 995));
    }

    #[test]
    fn clamps_delays_but_keeps_sentinels() {
        assert_eq!(effective_delay(0), MIN_DELAY);
        assert_eq!(effective_delay(50_000), MAX_DELAY);
        assert_eq!(effective_delay(i64::from(SKIP_DELAY)), SKIP_DELAY);
        assert_eq!(effective_delay(i64::from(ABORT_DELAY)), ABORT_DELAY);
    }
}
