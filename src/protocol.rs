use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::response::{filter_headers, slice_responses, IppResponse, LpdResponse, ResponseRecord};

/// LPD daemons report a failed command with this byte; a failed read is
/// recorded the same way.
pub const LPD_ERROR_BYTE: u8 = 0x45;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ipp,
    Lpd,
}

/// How one test case is exchanged over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeMode {
    /// Sender and receiver run concurrently; the reply is one buffer.
    Stream,
    /// Every packet is followed by exactly one read.
    Lockstep,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ipp => 631,
            Protocol::Lpd => 515,
        }
    }

    pub fn exchange_mode(self) -> ExchangeMode {
        match self {
            Protocol::Ipp => ExchangeMode::Stream,
            Protocol::Lpd => ExchangeMode::Lockstep,
        }
    }

    pub fn filter_response(self, raw: &[u8]) -> Vec<u8> {
        match self {
            Protocol::Ipp => filter_headers(raw),
            Protocol::Lpd => raw.to_vec(),
        }
    }

    pub fn decode(self, chunks: &[Vec<u8>]) -> Vec<ResponseRecord> {
        match self {
            Protocol::Ipp => {
                let joined = chunks.concat();
                slice_responses(&joined)
                    .into_iter()
                    .map(|slice| ResponseRecord::Ipp(IppResponse::parse(slice)))
                    .collect()
            }
            Protocol::Lpd => chunks
                .iter()
                .map(|chunk| ResponseRecord::Lpd(LpdResponse::parse(chunk)))
                .collect(),
        }
    }

    /// Whether the target accepted the request at all. Rejected requests
    /// end the current seed's mutation budget.
    pub fn is_valid(self, records: &[ResponseRecord]) -> bool {
        match self {
            Protocol::Ipp => records.iter().any(|r| r.http_code() == Some(200)),
            Protocol::Lpd => true,
        }
    }

    /// Whether a survival probe got a meaningful answer.
    pub fn survived(self, records: &[ResponseRecord]) -> bool {
        match self {
            Protocol::Ipp => !records.is_empty(),
            Protocol::Lpd => records.iter().any(|r| {
                matches!(r, ResponseRecord::Lpd(lpd) if lpd.data.first().is_some_and(|&b| b != LPD_ERROR_BYTE))
            }),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Ipp => "ipp",
            Protocol::Lpd => "lpd",
        })
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipp" => Ok(Protocol::Ipp),
            "lpd" => Ok(Protocol::Lpd),
            other => Err(format!("unsupported protocol `{other}`, expected ipp or lpd")),
        }
    }
}
