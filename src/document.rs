//! In-memory test case template: `Sequence > Packet > {Block, Data, Size, Checksum}`.
//!
//! Nodes are addressed by [`NodePath`], the child indices from the root.
//! Paths are only valid until the next structural edit.

use std::fmt;
use std::path::Path;

use tracing::warn;

use crate::error::DocumentError;
use crate::xml::{self, Element};

pub type NodePath = Vec<usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Sequence,
    Packet,
    Block,
    Data,
    Size,
    Checksum,
}

impl NodeKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "Sequence" => NodeKind::Sequence,
            "Packet" => NodeKind::Packet,
            "Block" => NodeKind::Block,
            "Data" => NodeKind::Data,
            "Size" => NodeKind::Size,
            "Checksum" => NodeKind::Checksum,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Sequence => "Sequence",
            NodeKind::Packet => "Packet",
            NodeKind::Block => "Block",
            NodeKind::Data => "Data",
            NodeKind::Size => "Size",
            NodeKind::Checksum => "Checksum",
        }
    }

    /// Only these kinds carry a value that leaf mutation may edit.
    pub fn is_leaf(self) -> bool {
        matches!(self, NodeKind::Data | NodeKind::Size | NodeKind::Checksum)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeEncoding {
    Byte,
    Hex,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeSpec {
    pub reference: String,
    pub encoding: SizeEncoding,
    pub endian: Endian,
    pub len: usize,
    pub diff: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.attr("mutable") != Some("false")
    }

    pub fn type_tag(&self) -> Option<&str> {
        self.attr("type")
    }

    pub fn name(&self) -> Option<&str> {
        self.attr("name")
    }

    pub fn value(&self) -> Result<Vec<u8>, DocumentError> {
        parse_hex_bytes(self.attr("value").unwrap_or_default())
    }

    pub fn set_value(&mut self, bytes: &[u8]) {
        self.set_attr("value", format_hex(bytes));
    }

    pub fn diff(&self) -> i64 {
        self.attr("diff")
            .and_then(|d| d.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn set_diff(&mut self, diff: i64) {
        self.set_attr("diff", diff.to_string());
    }

    /// Base delay of a Packet in ms, stored as little-endian hex bytes.
    pub fn base_delay(&self) -> Result<i64, DocumentError> {
        let bytes = parse_hex_bytes(self.attr("delay").unwrap_or_default())?;
        Ok(i64::try_from(le_value(&bytes, bytes.len().min(8))).unwrap_or(i64::MAX))
    }

    pub fn size_spec(&self) -> Result<SizeSpec, DocumentError> {
        let encoding = match self.attr("valueType") {
            Some("byte") => SizeEncoding::Byte,
            Some("hex") => SizeEncoding::Hex,
            Some("string") => SizeEncoding::String,
            Some(other) => {
                return Err(DocumentError::InvalidAttribute {
                    attribute: "valueType",
                    value: other.to_string(),
                })
            }
            None => {
                return Err(DocumentError::MissingAttribute {
                    element: "Size",
                    attribute: "valueType",
                })
            }
        };
        let endian = match self.attr("endian") {
            Some("little") => Endian::Little,
            Some("big") => Endian::Big,
            _ => {
                if encoding == SizeEncoding::Byte {
                    warn!("Size node without endian, using big endian");
                }
                Endian::Big
            }
        };
        let len = match self.attr("len") {
            Some(len) => len.trim().parse().map_err(|_| DocumentError::InvalidAttribute {
                attribute: "len",
                value: len.to_string(),
            })?,
            None => 0,
        };
        Ok(SizeSpec {
            reference: self.attr("ref").unwrap_or_default().to_string(),
            encoding,
            endian,
            len,
            diff: self.diff(),
        })
    }

    fn from_element(element: &Element) -> Result<Self, DocumentError> {
        let kind = NodeKind::from_name(&element.name)
            .ok_or_else(|| DocumentError::UnknownElement(element.name.clone()))?;
        let children = element
            .children
            .iter()
            .map(Node::from_element)
            .collect::<Result<_, _>>()?;
        Ok(Self {
            kind,
            attrs: element.attrs.clone(),
            children,
        })
    }

    fn to_element(&self) -> Element {
        Element {
            name: self.kind.name().to_string(),
            attrs: self.attrs.clone(),
            children: self.children.iter().map(Node::to_element).collect(),
            text: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Node,
}

impl Document {
    pub fn new(root: Node) -> Result<Self, DocumentError> {
        if root.kind != NodeKind::Sequence {
            return Err(DocumentError::WrongRoot {
                expected: "Sequence",
                found: root.kind.name().to_string(),
            });
        }
        Ok(Self { root })
    }

    pub fn parse(source: &str) -> Result<Self, DocumentError> {
        Self::from_element(&xml::parse_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        Self::from_element(&xml::parse_file(path)?)
    }

    fn from_element(element: &Element) -> Result<Self, DocumentError> {
        if element.name != "Sequence" {
            return Err(DocumentError::WrongRoot {
                expected: "Sequence",
                found: element.name.clone(),
            });
        }
        Self::new(Node::from_element(element)?)
    }

    pub fn to_xml(&self) -> Result<String, DocumentError> {
        xml::to_string(&self.root.to_element())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DocumentError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_xml()?).map_err(|source| DocumentError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn get(&self, path: &[usize]) -> Option<&Node> {
        path.iter()
            .try_fold(&self.root, |node, &i| node.children.get(i))
    }

    pub fn get_mut(&mut self, path: &[usize]) -> Option<&mut Node> {
        path.iter()
            .try_fold(&mut self.root, |node, &i| node.children.get_mut(i))
    }

    /// A usable template still has at least one child under the root.
    pub fn is_viable(&self) -> bool {
        !self.root.children.is_empty()
    }

    /// Every node under `from` (inclusive), pre-order.
    pub fn nodes(&self, from: &[usize]) -> Vec<NodePath> {
        let mut out = Vec::new();
        if let Some(node) = self.get(from) {
            collect_pre_order(node, &mut from.to_vec(), &mut out, &|_| true);
        }
        out
    }

    /// Data, Size and Checksum nodes under `from`, in document order.
    pub fn leaves(&self, from: &[usize]) -> Vec<NodePath> {
        let mut out = Vec::new();
        if let Some(node) = self.get(from) {
            collect_pre_order(node, &mut from.to_vec(), &mut out, &|n| n.kind.is_leaf());
        }
        out
    }

    /// Nodes of `kind` with every descendant listed before its ancestor.
    pub fn post_order(&self, kind: NodeKind) -> Vec<NodePath> {
        let mut out = Vec::new();
        collect_post_order(&self.root, &mut Vec::new(), &mut out, kind);
        out
    }

    pub fn enclosing_packet(&self, path: &[usize]) -> Option<NodePath> {
        (0..=path.len())
            .rev()
            .map(|n| &path[..n])
            .find(|prefix| self.get(prefix).map(|n| n.kind) == Some(NodeKind::Packet))
            .map(<[usize]>::to_vec)
    }

    /// Resolves a dotted path of `name` attributes starting at the root,
    /// falling back to the packet that owns `origin`.
    pub fn resolve_name(&self, dotted: &str, origin: &[usize]) -> Option<NodePath> {
        let segments: Vec<&str> = dotted.split('.').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return None;
        }
        let from_root = self.walk(&[], &segments, Node::name);
        if from_root.is_some() {
            return from_root;
        }
        let packet = self.enclosing_packet(origin)?;
        self.walk(&packet, &segments, Node::name)
    }

    /// Resolves a dotted path of `type` attributes below `from`.
    pub fn resolve_type(&self, dotted: &str, from: &[usize]) -> Option<NodePath> {
        let segments: Vec<&str> = dotted.split('.').filter(|s| !s.is_empty()).collect();
        self.walk(from, &segments, Node::type_tag)
    }

    fn walk(
        &self,
        from: &[usize],
        segments: &[&str],
        key: fn(&Node) -> Option<&str>,
    ) -> Option<NodePath> {
        let mut path = from.to_vec();
        for segment in segments {
            let node = self.get(&path)?;
            let index = node
                .children
                .iter()
                .position(|c| key(c) == Some(segment))?;
            path.push(index);
        }
        Some(path)
    }

    /// Concatenated bytes of every Data and Size leaf under `path`.
    pub fn assemble(&self, path: &[usize]) -> Result<Vec<u8>, DocumentError> {
        let mut buffer = Vec::new();
        if let Some(node) = self.get(path) {
            assemble_into(node, &mut buffer)?;
        }
        Ok(buffer)
    }
}

fn collect_pre_order(
    node: &Node,
    path: &mut NodePath,
    out: &mut Vec<NodePath>,
    keep: &dyn Fn(&Node) -> bool,
) {
    if keep(node) {
        out.push(path.clone());
    }
    for (i, child) in node.children.iter().enumerate() {
        path.push(i);
        collect_pre_order(child, path, out, keep);
        path.pop();
    }
}

fn collect_post_order(node: &Node, path: &mut NodePath, out: &mut Vec<NodePath>, kind: NodeKind) {
    for (i, child) in node.children.iter().enumerate() {
        path.push(i);
        collect_post_order(child, path, out, kind);
        path.pop();
    }
    if node.kind == kind {
        out.push(path.clone());
    }
}

fn assemble_into(node: &Node, buffer: &mut Vec<u8>) -> Result<(), DocumentError> {
    match node.kind {
        NodeKind::Data | NodeKind::Size => buffer.extend(node.value()?),
        NodeKind::Checksum => {}
        NodeKind::Sequence | NodeKind::Packet | NodeKind::Block => {
            for child in &node.children {
                assemble_into(child, buffer)?;
            }
        }
    }
    Ok(())
}

/// Parses whitespace separated hex bytes such as `"41 42"`. Tokens longer
/// than two digits are read as packed hex (`"4142"`).
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, DocumentError> {
    let mut bytes = Vec::new();
    for token in text.split_whitespace() {
        if token.len() <= 2 {
            let byte = u8::from_str_radix(token, 16)
                .map_err(|_| DocumentError::InvalidHex(token.to_string()))?;
            bytes.push(byte);
        } else {
            bytes.extend(hex::decode(token).map_err(|_| DocumentError::InvalidHex(token.to_string()))?);
        }
    }
    Ok(bytes)
}

pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Little-endian integer from the first `len` bytes (missing bytes are zero).
pub fn le_value(bytes: &[u8], len: usize) -> u64 {
    bytes
        .iter()
        .take(len.min(8))
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (i * 8)))
}

pub fn to_bytes(value: u64, len: usize, endian: Endian) -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..len)
        .map(|i| if i < 8 { (value >> (i * 8)) as u8 } else { 0 })
        .collect();
    if endian == Endian::Big {
        bytes.reverse();
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"
<Sequence>
  <Packet delay="64 00" type="request" name="Req">
    <Size name="Len" ref="Req.Body" valueType="byte" len="2" endian="big" value="00 03"/>
    <Block name="Body" type="body">
      <Data type="op" value="41 42"/>
      <Data mutable="false" value="43"/>
    </Block>
    <Checksum value="00"/>
  </Packet>
</Sequence>"#;

    #[test]
    fn parses_template_tree() {
        let doc = Document::parse(TEMPLATE).unwrap();
        assert_eq!(doc.root().kind, NodeKind::Sequence);
        let packet = doc.get(&[0]).unwrap();
        assert_eq!(packet.kind, NodeKind::Packet);
        assert_eq!(packet.base_delay().unwrap(), 100);
        assert_eq!(doc.leaves(&[]).len(), 4);
        assert!(!doc.get(&[0, 1, 1]).unwrap().is_mutable());
    }

    #[test]
    fn assembles_data_and_size_but_not_checksum() {
        let doc = Document::parse(TEMPLATE).unwrap();
        assert_eq!(doc.assemble(&[0]).unwrap(), vec![0x00, 0x03, 0x41, 0x42, 0x43]);
    }

    #[test]
    fn resolves_name_paths() {
        let doc = Document::parse(TEMPLATE).unwrap();
        assert_eq!(doc.resolve_name("Req.Body", &[0, 0]), Some(vec![0, 1]));
        // Relative to the owning packet when the root has no such child.
        assert_eq!(doc.resolve_name("Body", &[0, 0]), Some(vec![0, 1]));
        assert_eq!(doc.resolve_name("Missing", &[0, 0]), None);
    }

    #[test]
    fn post_order_lists_inner_sizes_first() {
        let doc = Document::parse(
            r#"<Sequence><Packet>
                 <Size name="outer" value="00"/>
                 <Block><Size name="inner" value="00"/></Block>
               </Packet></Sequence>"#,
        )
        .unwrap();
        let sizes = doc.post_order(NodeKind::Size);
        assert_eq!(sizes, vec![vec![0, 0], vec![0, 1, 0]]);
    }

    #[test]
    fn rejects_unknown_elements_and_roots() {
        assert!(matches!(
            Document::parse("<Sequence><Frame/></Sequence>"),
            Err(DocumentError::UnknownElement(_))
        ));
        assert!(matches!(
            Document::parse("<Packet/>"),
            Err(DocumentError::WrongRoot { .. })
        ));
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(parse_hex_bytes("41 4 ff").unwrap(), vec![0x41, 0x04, 0xff]);
        assert_eq!(parse_hex_bytes("4142").unwrap(), vec![0x41, 0x42]);
        assert!(parse_hex_bytes("zz").is_err());
        assert_eq!(format_hex(&[0x0a, 0xff]), "0a ff");
        assert_eq!(le_value(&[0x64, 0x00], 2), 100);
        assert_eq!(to_bytes(4, 2, Endian::Little), vec![4, 0]);
        assert_eq!(to_bytes(4, 2, Endian::Big), vec![0, 4]);
    }

    #[test]
    fn survives_a_save_and_load() {
        let doc = Document::parse(TEMPLATE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.xml");
        doc.save(&path).unwrap();
        assert_eq!(Document::load(&path).unwrap(), doc);
    }
}
