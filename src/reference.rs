//! Reference documents declare weighted mutation policies for fields that
//! belong to a known packet, identified by `Id` conditions.

use std::path::Path;

use tracing::{info, warn};

use crate::document::{le_value, parse_hex_bytes};
use crate::error::{DocumentError, ReferenceError};
use crate::xml::{self, Element};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reference {
    pub series: Vec<PacketSeries>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PacketSeries {
    pub type_tag: String,
    pub packets: Vec<RefPacket>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefPacket {
    pub ids: Vec<IdCondition>,
    pub paras: Vec<Para>,
}

/// The field at `type_path` (relative to the packet) must hold `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct IdCondition {
    pub type_path: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Para {
    pub type_path: String,
    pub policy: Policy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    Range(RangePolicy),
    Case(Vec<CaseOption>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangePolicy {
    /// Byte length of the field, values are little endian.
    pub len: usize,
    pub min: u64,
    pub max: u64,
    pub weights: Vec<(u64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseOption {
    pub value: String,
    pub weight: f64,
}

impl Reference {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReferenceError> {
        let path = path.as_ref();
        info!(path = %path.display(), "parsing reference");
        Self::from_element(&xml::parse_file(path)?)
    }

    pub fn parse(source: &str) -> Result<Self, ReferenceError> {
        Self::from_element(&xml::parse_str(source)?)
    }

    fn from_element(root: &Element) -> Result<Self, ReferenceError> {
        if root.name != "Reference" {
            return Err(ReferenceError::MissingRoot);
        }
        let series = root
            .children_named("PacketSeries")
            .map(|series| -> Result<PacketSeries, ReferenceError> {
                Ok(PacketSeries {
                    type_tag: series.attr("type").unwrap_or_default().to_string(),
                    packets: series
                        .children_named("Packet")
                        .map(parse_packet)
                        .collect::<Result<_, ReferenceError>>()?,
                })
            })
            .collect::<Result<_, ReferenceError>>()?;
        Ok(Self { series })
    }

    pub fn series(&self, type_tag: &str) -> Option<&PacketSeries> {
        self.series.iter().find(|s| s.type_tag == type_tag)
    }
}

fn parse_packet(packet: &Element) -> Result<RefPacket, ReferenceError> {
    let ids = packet
        .children_named("Id")
        .map(|id| -> Result<IdCondition, DocumentError> {
            let value = id.child("Value").map(|v| v.text.as_str()).unwrap_or_default();
            Ok(IdCondition {
                type_path: id.attr("type").unwrap_or_default().to_string(),
                value: parse_hex_bytes(value)?,
            })
        })
        .collect::<Result<_, DocumentError>>()?;
    let paras = packet
        .children_named("Para")
        .map(parse_para)
        .collect::<Result<_, _>>()?;
    Ok(RefPacket { ids, paras })
}

fn parse_para(para: &Element) -> Result<Para, ReferenceError> {
    let type_path = para.attr("type").unwrap_or_default().to_string();
    let policy = match para.attr("mutation").unwrap_or_default() {
        "range" => {
            let len = para
                .attr("len")
                .and_then(|l| l.trim().parse().ok())
                .unwrap_or(1);
            let read = |text: &str| -> Result<u64, DocumentError> {
                Ok(le_value(&parse_hex_bytes(text)?, len))
            };
            let min = read(para.attr("min").unwrap_or_default())?;
            let max = read(para.attr("max").unwrap_or_default())?;
            if min > max {
                return Err(ReferenceError::InvertedRange(type_path));
            }
            let mut weights = Vec::new();
            for weight in para.children_named("Weight") {
                let case = read(weight.attr("case").unwrap_or_default())?;
                let Ok(w) = weight.text.trim().parse::<f64>() else {
                    warn!(para = %type_path, text = %weight.text, "ignoring unparsable weight");
                    continue;
                };
                weights.push((case, w));
            }
            Policy::Range(RangePolicy {
                len,
                min,
                max,
                weights,
            })
        }
        "case" => Policy::Case(
            para.children_named("case")
                .map(|case| CaseOption {
                    value: case.attr("value").unwrap_or_default().to_string(),
                    weight: case
                        .attr("weight")
                        .and_then(|w| w.trim().parse().ok())
                        .unwrap_or(0.0),
                })
                .collect(),
        ),
        other => return Err(ReferenceError::UnknownMutation(type_path, other.to_string())),
    };
    Ok(Para { type_path, policy })
}
