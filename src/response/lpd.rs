use std::fmt;

use crate::document::format_hex;

/// Raw reply to one LPD command. Daemons answer with a single
/// acknowledgement byte or a textual queue listing.
#[derive(Debug, Clone, Default)]
pub struct LpdResponse {
    pub data: Vec<u8>,
}

impl LpdResponse {
    pub fn parse(raw: &[u8]) -> Self {
        Self { data: raw.to_vec() }
    }

    pub fn is_ack(&self) -> bool {
        self.data.len() == 1
    }
}

/// Two replies are the same when they start with the same byte.
impl PartialEq for LpdResponse {
    fn eq(&self, other: &Self) -> bool {
        self.data.first() == other.data.first()
    }
}

impl fmt::Display for LpdResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_hex(&self.data))
    }
}
