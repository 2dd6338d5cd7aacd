//! Decoded responses and the distances the seed pool ranks them by.

mod ipp;
mod lpd;

use std::fmt;

pub use self::ipp::{filter_headers, slice_responses, Attribute, AttributeGroup, IppResponse, NO_STATUS};
pub use self::lpd::LpdResponse;

use crate::document::format_hex;

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseRecord {
    Ipp(IppResponse),
    Lpd(LpdResponse),
    Generic(Vec<u8>),
}

impl ResponseRecord {
    pub fn http_code(&self) -> Option<u16> {
        match self {
            ResponseRecord::Ipp(ipp) => Some(ipp.http_code),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseRecord::Ipp(ipp) => fmt::Display::fmt(ipp, f),
            ResponseRecord::Lpd(lpd) => fmt::Display::fmt(lpd, f),
            ResponseRecord::Generic(raw) => f.write_str(&format_hex(raw)),
        }
    }
}

/// Normalized Levenshtein similarity over bytes, 1.0 for identical input.
pub fn similarity(a: &[u8], b: &[u8]) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - strsim::generic_levenshtein(&a.to_vec(), &b.to_vec()) as f64 / longest as f64
}

/// Distance in `[0, 1]` between two responses.
pub fn distance(a: &ResponseRecord, b: &ResponseRecord) -> f64 {
    match (a, b) {
        (ResponseRecord::Ipp(a), ResponseRecord::Ipp(b)) => ipp_distance(a, b),
        (ResponseRecord::Lpd(a), ResponseRecord::Lpd(b)) => lpd_distance(a, b),
        _ if a == b => 0.0,
        _ => 1.0,
    }
}

fn ipp_distance(a: &IppResponse, b: &IppResponse) -> f64 {
    if a.http_code != b.http_code || a.status != b.status {
        return 1.0;
    }
    let state = (a.attribute("printer-state"), b.attribute("printer-state"));
    let message = (a.attribute("status-message"), b.attribute("status-message"));
    match (state, message) {
        ((None, None), _) | (_, (None, None)) => 0.0,
        ((Some(sa), Some(sb)), (Some(ma), Some(mb))) => {
            1.0 - (similarity(&sa.value, &sb.value) + similarity(&ma.value, &mb.value)) / 2.0
        }
        _ => 1.0,
    }
}

fn lpd_distance(a: &LpdResponse, b: &LpdResponse) -> f64 {
    match (a.is_ack(), b.is_ack()) {
        (true, true) if a.data == b.data => 0.0,
        (true, true) | (true, false) | (false, true) => 1.0,
        (false, false) => 1.0 - similarity(&a.data, &b.data),
    }
}

/// Dynamic time warping cost of aligning two response sequences.
pub fn sequence_distance(a: &[ResponseRecord], b: &[ResponseRecord]) -> f64 {
    let width = b.len() + 1;
    let mut dtw = vec![f64::INFINITY; (a.len() + 1) * width];
    dtw[0] = 0.0;
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let cost = distance(&a[i - 1], &b[j - 1]);
            let best = dtw[(i - 1) * width + j]
                .min(dtw[i * width + j - 1])
                .min(dtw[(i - 1) * width + j - 1]);
            dtw[i * width + j] = cost + best;
        }
    }
    dtw[a.len() * width + b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipp(code: u16, state: Option<&[u8]>, message: Option<&[u8]>) -> ResponseRecord {
        let mut attributes = Vec::new();
        if let Some(value) = state {
            attributes.push(Attribute {
                tag: 0x23,
                name: "printer-state".into(),
                value: value.to_vec(),
            });
        }
        if let Some(value) = message {
            attributes.push(Attribute {
                tag: 0x41,
                name: "status-message".into(),
                value: value.to_vec(),
            });
        }
        ResponseRecord::Ipp(IppResponse {
            http_code: code,
            groups: vec![AttributeGroup {
                tag: 0x04,
                attributes,
            }],
            ..IppResponse::default()
        })
    }

    fn lpd(data: &[u8]) -> ResponseRecord {
        ResponseRecord::Lpd(LpdResponse::parse(data))
    }

    #[test]
    fn ipp_distance_cases() {
        let full = ipp(200, Some(b"idle"), Some(b"ok"));
        assert_eq!(distance(&full, &full), 0.0);
        assert_eq!(distance(&full, &ipp(400, Some(b"idle"), Some(b"ok"))), 1.0);
        assert_eq!(distance(&ipp(200, None, None), &ipp(200, None, None)), 0.0);
        assert_eq!(distance(&full, &ipp(200, Some(b"idle"), None)), 1.0);
        let d = distance(&full, &ipp(200, Some(b"idle"), Some(b"ox")));
        assert!((d - 0.25).abs() < 1e-9, "{d}");
    }

    #[test]
    fn lpd_distance_cases() {
        assert_eq!(distance(&lpd(&[0]), &lpd(&[0])), 0.0);
        assert_eq!(distance(&lpd(&[0]), &lpd(&[1])), 1.0);
        assert_eq!(distance(&lpd(&[0]), &lpd(b"queue")), 1.0);
        assert_eq!(distance(&lpd(b"queue"), &lpd(b"queue")), 0.0);
        let d = distance(&lpd(b"abcd"), &lpd(b"abce"));
        assert!((d - 0.25).abs() < 1e-9);
    }

    #[test]
    fn mixed_variants_compare_structurally() {
        let raw = ResponseRecord::Generic(vec![1, 2]);
        assert_eq!(distance(&raw, &raw.clone()), 0.0);
        assert_eq!(distance(&raw, &lpd(&[1, 2])), 1.0);
    }

    #[test]
    fn sequence_distance_identity_and_alignment() {
        let seq = vec![lpd(&[0]), lpd(b"queue"), lpd(&[1])];
        assert_eq!(sequence_distance(&seq, &seq), 0.0);
        // A repeated element aligns at no extra cost.
        let stretched = vec![lpd(&[0]), lpd(&[0]), lpd(b"queue"), lpd(&[1])];
        assert_eq!(sequence_distance(&seq, &stretched), 0.0);
        assert_eq!(sequence_distance(&seq, &[lpd(&[9])]), 3.0);
        assert_eq!(sequence_distance(&[], &[]), 0.0);
        assert!(sequence_distance(&seq, &[]).is_infinite());
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity(b"", b""), 1.0);
        assert_eq!(similarity(b"abc", b"abc"), 1.0);
        assert_eq!(similarity(b"abc", b"xyz"), 0.0);
    }
}
