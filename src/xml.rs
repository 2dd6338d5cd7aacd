//! Minimal element tree over `xml-rs`, shared by templates, reference
//! documents and device configs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use xml::reader::{EventReader, ParserConfig, XmlEvent};
use xml::writer::{EmitterConfig, XmlEvent as WriterEvent};

use crate::error::DocumentError;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn entity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"<!ENTITY\s+(\S+)\s+"(.+?)">"#).expect("static regex"))
}

fn doctype_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!DOCTYPE[^\[>]*(\[.*?\])?\s*>").expect("static regex"))
}

/// Expands `<!ENTITY name "value">` declarations into every `&name;` use
/// and drops the DOCTYPE so the parser never sees custom entities.
pub fn expand_entities(source: &str) -> String {
    let entities: HashMap<String, String> = entity_regex()
        .captures_iter(source)
        .map(|cap| (format!("&{};", &cap[1]), cap[2].to_string()))
        .collect();

    let mut content = doctype_regex().replace_all(source, "").into_owned();
    for (name, value) in &entities {
        content = content.replace(name.as_str(), value);
    }
    content
}

pub fn parse_str(source: &str) -> Result<Element, DocumentError> {
    let expanded = expand_entities(source);
    let reader = EventReader::new_with_config(
        expanded.as_bytes(),
        ParserConfig::new()
            .trim_whitespace(true)
            .ignore_comments(true),
    );

    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;
    for event in reader {
        match event.map_err(|e| DocumentError::Xml(e.to_string()))? {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                let mut element = Element::new(name.local_name);
                element.attrs = attributes
                    .into_iter()
                    .map(|a| (a.name.local_name, a.value))
                    .collect();
                stack.push(element);
            }
            XmlEvent::EndElement { .. } => {
                let Some(done) = stack.pop() else {
                    return Err(DocumentError::Xml("unbalanced end element".into()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None => root = Some(done),
                }
            }
            XmlEvent::Characters(text) | XmlEvent::CData(text) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            _ => {}
        }
    }
    root.ok_or(DocumentError::Empty)
}

pub fn parse_file(path: impl AsRef<Path>) -> Result<Element, DocumentError> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|source| DocumentError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&source)
}

pub fn to_string(root: &Element) -> Result<String, DocumentError> {
    let mut out = Vec::new();
    {
        let mut writer = EmitterConfig::new()
            .perform_indent(true)
            .create_writer(&mut out);
        write_element(&mut writer, root).map_err(|e| DocumentError::Xml(e.to_string()))?;
    }
    String::from_utf8(out).map_err(|e| DocumentError::Xml(e.to_string()))
}

fn write_element<W: std::io::Write>(
    writer: &mut xml::writer::EventWriter<W>,
    element: &Element,
) -> xml::writer::Result<()> {
    let mut start = WriterEvent::start_element(element.name.as_str());
    for (key, value) in &element.attrs {
        start = start.attr(key.as_str(), value.as_str());
    }
    writer.write(start)?;
    if !element.text.is_empty() {
        writer.write(WriterEvent::characters(&element.text))?;
    }
    for child in &element.children {
        write_element(writer, child)?;
    }
    writer.write(WriterEvent::end_element())
}
