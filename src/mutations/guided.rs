//! Reference-guided mutation: fields whose packet matches a reference entry
//! draw their next value from the declared weighted policy.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::{debug, warn};

use crate::document::{le_value, parse_hex_bytes, to_bytes, Document, Endian, Node};
use crate::reference::{CaseOption, Para, Policy, RangePolicy, RefPacket, Reference};

/// Finds the policy for the leaf at `leaf`. Candidate series are keyed by the
/// `type` tags on the path from the leaf up to and including its Packet;
/// the tags below the matched series form the Para's dotted type.
pub fn find_para<'r>(doc: &Document, reference: &'r Reference, leaf: &[usize]) -> Option<&'r Para> {
    let packet = doc.enclosing_packet(leaf)?;
    let mut type_path = Vec::new();
    for depth in (packet.len()..=leaf.len()).rev() {
        type_path.push(doc.get(&leaf[..depth])?.type_tag().unwrap_or_default());
    }

    for (i, series_type) in type_path.iter().enumerate() {
        if series_type.is_empty() {
            continue;
        }
        let Some(series) = reference.series(series_type) else {
            continue;
        };
        let para_type = type_path[..i]
            .iter()
            .rev()
            .copied()
            .collect::<Vec<_>>()
            .join(".");
        let found = series
            .packets
            .iter()
            .filter(|candidate| ids_match(doc, &packet, candidate))
            .find_map(|candidate| candidate.paras.iter().find(|p| p.type_path == para_type));
        if found.is_some() {
            return found;
        }
    }
    None
}

/// Every `Id` condition must name an existing field holding exactly the
/// declared bytes.
fn ids_match(doc: &Document, packet: &[usize], candidate: &RefPacket) -> bool {
    candidate.ids.iter().all(|id| {
        doc.resolve_type(&id.type_path, packet)
            .and_then(|path| doc.assemble(&path).ok())
            .is_some_and(|bytes| bytes == id.value)
    })
}

/// Rewrites `node` according to `para`. Returns false when the policy has
/// no alternative to the current value.
pub fn apply_para<R: Rng + ?Sized>(rng: &mut R, para: &Para, node: &mut Node) -> bool {
    let Ok(current) = node.value() else {
        return false;
    };
    match &para.policy {
        Policy::Range(range) => {
            let current = le_value(&current, range.len);
            match sample_range(rng, range, current) {
                Some(value) => {
                    debug!(para = %para.type_path, from = current, to = value, "range mutation");
                    node.set_value(&to_bytes(value, range.len, Endian::Little));
                    true
                }
                None => false,
            }
        }
        Policy::Case(cases) => match sample_case(rng, cases, &current) {
            Some(bytes) => {
                node.set_value(&bytes);
                true
            }
            None => false,
        },
    }
}

/// Samples a value in `[min, max]` other than `current`.
///
/// Explicit weights keep their mass, the rest of the unit mass is spread
/// evenly over the unweighted values, and the current value's share is
/// dropped before renormalizing. When explicit weights consume all of the
/// mass the unweighted values get none; `None` means nothing is left.
pub fn sample_range<R: Rng + ?Sized>(rng: &mut R, range: &RangePolicy, current: u64) -> Option<u64> {
    let span = u128::from(range.max - range.min) + 1;
    let mut weights = BTreeMap::new();
    for &(value, weight) in &range.weights {
        if value < range.min || value > range.max {
            warn!(value, "weighted case outside of range, ignored");
            continue;
        }
        weights.insert(value, weight.max(0.0));
    }

    let rest = 1.0 - weights.values().sum::<f64>();
    let unweighted = span - weights.len() as u128;
    let per_value = if unweighted > 0 && rest > 0.0 {
        rest / unweighted as f64
    } else {
        0.0
    };

    let current_free = (range.min..=range.max).contains(&current) && !weights.contains_key(&current);
    let free_choices = unweighted - u128::from(current_free);

    let mut values = Vec::with_capacity(weights.len());
    let mut masses = Vec::with_capacity(weights.len() + 1);
    for (&value, &weight) in &weights {
        if value != current {
            values.push(value);
            masses.push(weight);
        }
    }
    masses.push(per_value * free_choices as f64);

    let index = WeightedIndex::new(&masses).ok()?.sample(rng);
    if index < values.len() {
        return Some(values[index]);
    }

    let mut excluded: Vec<u64> = weights.keys().copied().collect();
    if current_free {
        excluded.push(current);
        excluded.sort_unstable();
    }
    let k = rng.gen_range(0..free_choices);
    Some(nth_free(range.min, k, &excluded))
}

/// The `k`-th value at or above `min` that is not in the sorted `excluded`.
fn nth_free(min: u64, k: u128, excluded: &[u64]) -> u64 {
    let mut value = u128::from(min) + k;
    for &skip in excluded {
        if u128::from(skip) <= value {
            value += 1;
        } else {
            break;
        }
    }
    value as u64
}

fn sample_case<R: Rng + ?Sized>(rng: &mut R, cases: &[CaseOption], current: &[u8]) -> Option<Vec<u8>> {
    let mut choices = Vec::new();
    let mut weights = Vec::new();
    for case in cases {
        let Ok(bytes) = parse_hex_bytes(&case.value.to_lowercase()) else {
            warn!(value = %case.value, "case value is not hex, ignored");
            continue;
        };
        if bytes == current {
            continue;
        }
        choices.push(bytes);
        weights.push(case.weight);
    }
    let index = WeightedIndex::new(&weights).ok()?.sample(rng);
    Some(choices.swap_remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn range(min: u64, max: u64, weights: Vec<(u64, f64)>) -> RangePolicy {
        RangePolicy {
            len: 1,
            min,
            max,
            weights,
        }
    }

    #[test]
    fn never_samples_the_current_value() {
        let mut rng = StdRng::seed_from_u64(11);
        let configs = [
            range(0, 3, vec![]),
            range(0, 3, vec![(2, 0.9)]),
            range(5, 6, vec![]),
            range(0, 255, vec![(0, 0.2), (1, 0.2), (7, 0.5)]),
            range(0, 2, vec![(0, 0.5), (1, 0.5)]),
        ];
        for policy in &configs {
            for current in policy.min..=policy.max {
                for _ in 0..200 {
                    if let Some(value) = sample_range(&mut rng, policy, current) {
                        assert_ne!(value, current);
                        assert!((policy.min..=policy.max).contains(&value));
                    }
                }
            }
        }
    }

    #[test]
    fn single_value_range_has_no_alternative() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample_range(&mut rng, &range(4, 4, vec![]), 4), None);
    }

    #[test]
    fn exhausted_mass_leaves_only_weighted_values() {
        let mut rng = StdRng::seed_from_u64(5);
        let policy = range(0, 9, vec![(3, 1.0)]);
        for _ in 0..100 {
            assert_eq!(sample_range(&mut rng, &policy, 0), Some(3));
        }
        // The only weighted value is current and nothing else has mass.
        assert_eq!(sample_range(&mut rng, &policy, 3), None);
    }

    #[test]
    fn nth_free_skips_excluded_values() {
        assert_eq!(nth_free(0, 0, &[0, 1]), 2);
        assert_eq!(nth_free(10, 2, &[11]), 13);
        assert_eq!(nth_free(0, 3, &[5]), 3);
    }

    #[test]
    fn case_sampling_excludes_current_case_insensitively() {
        let mut rng = StdRng::seed_from_u64(2);
        let cases = vec![
            CaseOption {
                value: "4A".into(),
                weight: 1.0,
            },
            CaseOption {
                value: "4b".into(),
                weight: 1.0,
            },
        ];
        for _ in 0..50 {
            assert_eq!(sample_case(&mut rng, &cases, &[0x4a]), Some(vec![0x4b]));
        }
        assert_eq!(sample_case(&mut rng, &cases[..1], &[0x4a]), None);
    }

    #[test]
    fn finds_para_through_packet_type_and_id() {
        let doc = Document::parse(
            r#"<Sequence>
                 <Packet type="request">
                   <Data type="op" value="02 00"/>
                   <Block type="attr"><Data type="name" value="41"/></Block>
                 </Packet>
               </Sequence>"#,
        )
        .unwrap();
        let reference = Reference::parse(
            r#"<Reference>
                 <PacketSeries type="request">
                   <Packet>
                     <Id type="op"><Value>05 00</Value></Id>
                     <Para type="attr.name" mutation="case"><case value="ff" weight="1"/></Para>
                   </Packet>
                   <Packet>
                     <Id type="op"><Value>02 00</Value></Id>
                     <Para type="attr.name" mutation="case"><case value="42" weight="1"/></Para>
                   </Packet>
                 </PacketSeries>
               </Reference>"#,
        )
        .unwrap();
        let para = find_para(&doc, &reference, &[0, 1, 0]).unwrap();
        match &para.policy {
            Policy::Case(cases) => assert_eq!(cases[0].value, "42"),
            other => panic!("unexpected {other:?}"),
        }
        // The op field itself has no Para of type "op".
        assert!(find_para(&doc, &reference, &[0, 0]).is_none());
    }
}
