mod bytes;
mod guided;
mod size;
mod structure;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::document::{Document, NodeKind, NodePath};
use crate::reference::Reference;

pub use self::bytes::{mutate_bytes, DataMutation};
pub use self::guided::{find_para, sample_range};
pub use self::size::{encode_size, recompute_sizes};
pub use self::structure::{sample_delay, StructureMutation};

/// Edits applied to a working template between rounds. Every operation
/// returns false when it found nothing it was allowed to change.
pub trait Mutator {
    /// Mutates the value of one random leaf under `at`.
    fn mutate_leaf(&mut self, doc: &mut Document, at: &[usize]) -> bool;
    /// Swaps, deletes or duplicates one child of the node at `at`.
    fn mutate_structure(&mut self, doc: &mut Document, at: &[usize]) -> bool;
    /// Moves the delay of the Packet at `packet`.
    fn mutate_delay(&mut self, doc: &mut Document, packet: &[usize]) -> bool;
    fn is_valid(&self, doc: &Document) -> bool;
}

pub struct DocumentMutator {
    rng: StdRng,
    reference: Option<Reference>,
}

impl DocumentMutator {
    pub fn new(seed: u64, reference: Option<Reference>) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            reference,
        }
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Any node of the document, the root included.
    pub fn select_node(&mut self, doc: &Document) -> NodePath {
        let nodes = doc.nodes(&[]);
        nodes[self.rng.gen_range(0..nodes.len())].clone()
    }

    pub fn select_child(&mut self, doc: &Document, of: &[usize]) -> Option<NodePath> {
        let count = doc.get(of)?.children.len();
        if count == 0 {
            return None;
        }
        let mut path = of.to_vec();
        path.push(self.rng.gen_range(0..count));
        Some(path)
    }

    fn select_leaf(&mut self, doc: &Document, at: &[usize]) -> Option<NodePath> {
        let leaves: Vec<NodePath> = doc
            .leaves(at)
            .into_iter()
            .filter(|path| doc.get(path).is_some_and(|n| n.is_mutable()))
            .collect();
        if leaves.is_empty() {
            return None;
        }
        Some(leaves[self.rng.gen_range(0..leaves.len())].clone())
    }

    fn mutate_by_reference(&mut self, doc: &mut Document, leaf: &[usize]) -> bool {
        let Some(reference) = &self.reference else {
            return false;
        };
        let Some(para) = find_para(doc, reference, leaf) else {
            return false;
        };
        debug!(para = %para.type_path, "reference guided mutation");
        match doc.get_mut(leaf) {
            Some(node) => guided::apply_para(&mut self.rng, para, node),
            None => false,
        }
    }

    fn mutate_value(&mut self, doc: &mut Document, leaf: &[usize]) -> bool {
        let Some(node) = doc.get_mut(leaf) else {
            return false;
        };
        match node.kind {
            NodeKind::Data => {
                let Ok(mut value) = node.value() else {
                    warn!(path = ?leaf, "data value is not hex, skipped");
                    return false;
                };
                let Some(action) = mutate_bytes(&mut self.rng, &mut value) else {
                    return false;
                };
                node.set_value(&value);
                debug!(?action, len = value.len(), "data mutation");
                !action.changes_length() || resize(doc)
            }
            NodeKind::Size => {
                let delta = size::mutate_size(&mut self.rng, node);
                debug!(delta, "size mutation");
                resize(doc)
            }
            // Checksums are carried verbatim.
            NodeKind::Checksum => false,
            NodeKind::Sequence | NodeKind::Packet | NodeKind::Block => false,
        }
    }
}

fn resize(doc: &mut Document) -> bool {
    match recompute_sizes(doc) {
        Ok(()) => true,
        Err(err) => {
            warn!(%err, "size recompute failed");
            false
        }
    }
}

impl Mutator for DocumentMutator {
    fn mutate_leaf(&mut self, doc: &mut Document, at: &[usize]) -> bool {
        let Some(leaf) = self.select_leaf(doc, at) else {
            return false;
        };
        // A failed attempt leaves the template as it was.
        let snapshot = doc.clone();
        let typed = doc.get(&leaf).and_then(|n| n.type_tag()).is_some();
        let changed = if typed && self.mutate_by_reference(doc, &leaf) {
            resize(doc)
        } else {
            self.mutate_value(doc, &leaf)
        };
        if !changed {
            *doc = snapshot;
        }
        changed
    }

    fn mutate_structure(&mut self, doc: &mut Document, at: &[usize]) -> bool {
        let Some(node) = doc.get_mut(at) else {
            return false;
        };
        if !node.kind.is_leaf() {
            if let Some(action) = structure::mutate_children(&mut self.rng, node) {
                debug!(?action, path = ?at, "structure mutation");
                return true;
            }
        }
        false
    }

    fn mutate_delay(&mut self, doc: &mut Document, packet: &[usize]) -> bool {
        let Some(node) = doc.get_mut(packet) else {
            return false;
        };
        if node.kind != NodeKind::Packet || !node.is_mutable() {
            return false;
        }
        let Ok(base) = node.base_delay() else {
            return false;
        };
        let diff = sample_delay(&mut self.rng, base, node.diff());
        debug!(base, diff, "delay mutation");
        node.set_diff(diff);
        true
    }

    fn is_valid(&self, doc: &Document) -> bool {
        doc.is_viable()
    }
}
