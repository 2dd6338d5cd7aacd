use rand::Rng;
use tracing::warn;

use crate::config::ARITH_MAX;
use crate::document::{to_bytes, Document, Node, NodeKind, NodePath, SizeEncoding, SizeSpec};
use crate::error::DocumentError;

/// Shifts the Size node's accumulated `diff` by a non-zero delta.
pub fn mutate_size<R: Rng + ?Sized>(rng: &mut R, node: &mut Node) -> i64 {
    let delta = rng.gen_range(1..=ARITH_MAX);
    let delta = if rng.gen_bool(0.5) { -delta } else { delta };
    node.set_diff(node.diff().saturating_add(delta));
    delta
}

/// Re-encodes every Size node. Nodes are visited in post-order, except that
/// a Size whose target contains other Size nodes always waits for them.
pub fn recompute_sizes(doc: &mut Document) -> Result<(), DocumentError> {
    let sizes = doc.post_order(NodeKind::Size);
    let mut plans = Vec::with_capacity(sizes.len());
    for path in &sizes {
        let Some(node) = doc.get(path) else {
            continue;
        };
        let spec = node.size_spec()?;
        let target = doc.resolve_name(&spec.reference, path);
        if target.is_none() {
            warn!(reference = %spec.reference, "size reference does not resolve");
        }
        plans.push((path.clone(), spec, target));
    }

    for index in dependency_order(&plans) {
        let (path, spec, target) = &plans[index];
        let length = match target {
            Some(target) => doc.assemble(target)?.len(),
            None => 0,
        };
        let encoded = encode_size((length as i64).saturating_add(spec.diff), spec);
        if let Some(node) = doc.get_mut(path) {
            node.set_value(&encoded);
        }
    }
    Ok(())
}

fn dependency_order(plans: &[(NodePath, SizeSpec, Option<NodePath>)]) -> Vec<usize> {
    let mut done = vec![false; plans.len()];
    let mut order = Vec::with_capacity(plans.len());
    while order.len() < plans.len() {
        let ready = (0..plans.len()).find(|&i| {
            !done[i]
                && (0..plans.len()).all(|j| {
                    j == i
                        || done[j]
                        || !matches!(&plans[i].2, Some(target) if plans[j].0.starts_with(target))
                })
        });
        // A Size inside its own target can never be ready; take it in post-order.
        let Some(next) = ready.or_else(|| (0..plans.len()).find(|&i| !done[i])) else {
            break;
        };
        done[next] = true;
        order.push(next);
    }
    order
}

/// Encodes a size value. Negative values, reachable through a drifting
/// `diff`, are clamped to zero.
pub fn encode_size(value: i64, spec: &SizeSpec) -> Vec<u8> {
    let value = value.max(0);
    match spec.encoding {
        SizeEncoding::Byte => to_bytes(value as u64, spec.len, spec.endian),
        SizeEncoding::Hex => format!("{value:x}").into_bytes(),
        SizeEncoding::String => value.to_string().into_bytes(),
    }
}
