use std::fmt;
use std::sync::OnceLock;

use regex::bytes::Regex;

/// Absent IPP status codes decode to this marker.
pub const NO_STATUS: u16 = 0xeeee;

const END_OF_ATTRIBUTES: u8 = 0x03;

/// Attribute values are only compared for these names, the rest carry
/// timestamps and ids that change on every request.
const COMPARED_VALUES: [&str; 3] = ["", "status-message", "job-state-reasons"];

#[derive(Debug, Clone, Default)]
pub struct Attribute {
    pub tag: u8,
    pub name: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct AttributeGroup {
    pub tag: u8,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct IppResponse {
    pub http_version: f64,
    pub http_code: u16,
    pub version: u16,
    pub status: u16,
    pub request_id: u32,
    pub groups: Vec<AttributeGroup>,
}

impl Default for IppResponse {
    fn default() -> Self {
        Self {
            http_version: 0.0,
            http_code: 0,
            version: 0,
            status: NO_STATUS,
            request_id: 0,
            groups: Vec::new(),
        }
    }
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d\.\d").expect("static regex"))
}

fn code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{3}").expect("static regex"))
}

fn status_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?-u)HTTP/\d\.\d\s\d{3}\s[^\r\n]*\r\n").expect("static regex"))
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Replaces every HTTP header block with just its status line.
pub fn filter_headers(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = find(rest, b"HTTP") {
        let Some(end) = find(&rest[start..], b"\r\n\r\n").map(|e| start + e) else {
            break;
        };
        out.extend_from_slice(&rest[..start]);
        if let Some(line) = status_line_regex().find(&rest[start..end + 4]) {
            out.extend_from_slice(line.as_bytes());
        }
        rest = &rest[end + 4..];
    }
    out.extend_from_slice(rest);
    out
}

/// Splits a buffer so that each slice starts at an `HTTP` marker. Bytes
/// ahead of the first marker form their own slice.
pub fn slice_responses(raw: &[u8]) -> Vec<&[u8]> {
    let mut starts: Vec<usize> = raw
        .windows(4)
        .enumerate()
        .filter(|(_, w)| *w == b"HTTP")
        .map(|(i, _)| i)
        .collect();
    if starts.first() != Some(&0) {
        starts.insert(0, 0);
    }
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| &raw[start..starts.get(i + 1).copied().unwrap_or(raw.len())])
        .filter(|slice| !slice.is_empty())
        .collect()
}

impl IppResponse {
    pub fn parse(raw: &[u8]) -> Self {
        let mut response = Self::default();
        let mut rest = raw;

        while find(rest, b"HTTP").is_some() {
            let (end, skip) = match find(rest, b"\r\n\r\n") {
                Some(end) => (end, 4),
                None => match find(rest, b"\r\n") {
                    Some(end) => (end, 2),
                    None => (rest.len(), 0),
                },
            };
            let header = &rest[..end];
            if let Some(m) = version_regex().find(header) {
                response.http_version = std::str::from_utf8(m.as_bytes())
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0.0);
            }
            if let Some(m) = code_regex().find(header) {
                response.http_code = std::str::from_utf8(m.as_bytes())
                    .ok()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
            }
            rest = &rest[end + skip..];
            if rest.starts_with(b"400") {
                response.http_code = 400;
                return response;
            }
        }

        if rest.len() < 2 || response.http_code != 200 {
            return response;
        }
        let body = if rest[0].is_ascii_hexdigit() {
            dechunk(rest)
        } else {
            rest.to_vec()
        };
        response.parse_body(&body);
        response.filter_status_message();
        response
    }

    fn parse_body(&mut self, body: &[u8]) {
        let mut rest = body;
        let Some(version) = take_u16(&mut rest) else {
            return;
        };
        self.version = version;
        let Some(status) = take_u16(&mut rest) else {
            return;
        };
        self.status = status;
        let Some(id) = take(&mut rest, 4) else {
            return;
        };
        self.request_id = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
        self.parse_groups(rest);
    }

    fn parse_groups(&mut self, mut rest: &[u8]) {
        while let Some(&tag) = rest.first() {
            if tag == END_OF_ATTRIBUTES {
                self.groups.push(AttributeGroup {
                    tag,
                    attributes: Vec::new(),
                });
                return;
            }
            rest = &rest[1..];
            if rest.len() < 2 {
                return;
            }
            let mut group = AttributeGroup {
                tag,
                attributes: Vec::new(),
            };
            while let Some(&attr_tag) = rest.first() {
                if is_delimiter(attr_tag) {
                    break;
                }
                rest = &rest[1..];
                let Some(name_len) = take_u16(&mut rest) else {
                    return;
                };
                let Some(name) = take(&mut rest, name_len.into()) else {
                    return;
                };
                let Some(value_len) = take_u16(&mut rest) else {
                    return;
                };
                let Some(value) = take(&mut rest, value_len.into()) else {
                    return;
                };
                group.attributes.push(Attribute {
                    tag: attr_tag,
                    name: String::from_utf8_lossy(name).into_owned(),
                    value: value.to_vec(),
                });
            }
            self.groups.push(group);
        }
    }

    /// Drops the request-specific tail of `status-message` values.
    fn filter_status_message(&mut self) {
        const PREFIXES: [(&[u8], usize); 2] = [
            (b"Bad request version number", 25),
            (b"Bad request-id", 13),
        ];
        for attr in self
            .groups
            .iter_mut()
            .flat_map(|g| g.attributes.iter_mut())
            .filter(|a| a.name == "status-message")
        {
            if let Some(&(_, keep)) = PREFIXES
                .iter()
                .find(|(prefix, keep)| attr.value.starts_with(&prefix[..*keep]))
            {
                attr.value.truncate(keep);
            } else if let Some(quote) = attr.value.iter().position(|&b| b == b'"') {
                attr.value.truncate(quote);
            }
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.groups
            .iter()
            .flat_map(|g| &g.attributes)
            .find(|a| a.name == name)
    }
}

impl PartialEq for IppResponse {
    fn eq(&self, other: &Self) -> bool {
        if self.http_code != other.http_code
            || self.status != other.status
            || self.groups.len() != other.groups.len()
        {
            return false;
        }
        self.groups.iter().zip(&other.groups).all(|(a, b)| {
            a.attributes.len() == b.attributes.len()
                && a.attributes.iter().zip(&b.attributes).all(|(x, y)| {
                    x.tag == y.tag
                        && x.name == y.name
                        && (!COMPARED_VALUES.contains(&x.name.as_str()) || x.value == y.value)
                })
        })
    }
}

impl fmt::Display for IppResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HTTP version: {:.1}", self.http_version)?;
        writeln!(f, "HTTP status code: {}", self.http_code)?;
        if self.version != 0 {
            writeln!(f, "IPP version number: 0x{:04x}", self.version)?;
        }
        if self.status != NO_STATUS {
            writeln!(f, "IPP status code: 0x{:04x}", self.status)?;
        }
        if self.request_id != 0 {
            writeln!(f, "IPP request id: {}", self.request_id)?;
        }
        for group in &self.groups {
            writeln!(f, "Attribute group 0x{:02x}", group.tag)?;
            for attr in &group.attributes {
                writeln!(
                    f,
                    "  0x{:02x} {} = {}",
                    attr.tag,
                    attr.name,
                    crate::document::format_hex(&attr.value)
                )?;
            }
        }
        Ok(())
    }
}

fn is_delimiter(tag: u8) -> bool {
    (0x01..=0x05).contains(&tag)
}

fn take<'a>(rest: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if rest.len() < n {
        return None;
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Some(head)
}

fn take_u16(rest: &mut &[u8]) -> Option<u16> {
    take(rest, 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Undoes HTTP chunked transfer coding. Anything that stops looking like a
/// chunk header is kept verbatim.
fn dechunk(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut rest = body;
    loop {
        let digits = rest.iter().take_while(|b| b.is_ascii_hexdigit()).count();
        let len = std::str::from_utf8(&rest[..digits])
            .ok()
            .and_then(|d| usize::from_str_radix(d, 16).ok());
        let Some(len) = len.filter(|_| rest[digits..].starts_with(b"\r\n")) else {
            out.extend_from_slice(rest);
            return out;
        };
        rest = &rest[digits + 2..];
        if len == 0 {
            return out;
        }
        let chunk = len.min(rest.len());
        out.extend_from_slice(&rest[..chunk]);
        rest = &rest[chunk..];
        rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);
        if rest.is_empty() {
            return out;
        }
    }
}
