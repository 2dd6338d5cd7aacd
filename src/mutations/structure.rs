use rand::Rng;

use crate::config::{MAX_DELAY, MIN_DELAY};
use crate::document::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureMutation {
    Swap,
    Delete,
    Duplicate,
}

/// Reorders, removes or repeats one child of `node`. A duplicate lands
/// after a second randomly chosen child. Returns `None` when
/// the node has no children to work with.
pub fn mutate_children<R: Rng + ?Sized>(rng: &mut R, node: &mut Node) -> Option<StructureMutation> {
    let len = node.children.len();
    if len == 0 {
        return None;
    }
    let mut actions = vec![StructureMutation::Delete, StructureMutation::Duplicate];
    if len >= 2 {
        actions.push(StructureMutation::Swap);
    }
    let action = actions[rng.gen_range(0..actions.len())];
    match action {
        StructureMutation::Swap => {
            let a = rng.gen_range(0..len);
            let mut b = rng.gen_range(0..len - 1);
            if b >= a {
                b += 1;
            }
            node.children.swap(a, b);
        }
        StructureMutation::Delete => {
            node.children.remove(rng.gen_range(0..len));
        }
        StructureMutation::Duplicate => {
            let copy = node.children[rng.gen_range(0..len)].clone();
            node.children.insert(rng.gen_range(0..len) + 1, copy);
        }
    }
    Some(action)
}

/// Draws a new effective delay from `[d/2, 2d]` around the current one and
/// stores it as a diff from the packet's base delay. Values outside the
/// working envelope collapse onto the skip and abort sentinels.
pub fn sample_delay<R: Rng + ?Sized>(rng: &mut R, base: i64, diff: i64) -> i64 {
    let current = base
        .saturating_add(diff)
        .clamp(0, 2 * i64::from(MAX_DELAY));
    let (mut low, mut high) = (current / 2, current * 2);
    if low > high {
        std::mem::swap(&mut low, &mut high);
    }
    if low == high {
        high += 1;
    }
    let sampled = rng.gen_range(low..=high);
    let effective = if sampled < i64::from(MIN_DELAY) {
        i64::from(MIN_DELAY) - 1
    } else if sampled > i64::from(MAX_DELAY) {
        i64::from(MAX_DELAY) + 1
    } else {
        sampled
    };
    effective - base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ABORT_DELAY, SKIP_DELAY};
    use crate::document::NodeKind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn block(values: &[&str]) -> Node {
        values.iter().fold(Node::new(NodeKind::Block), |node, value| {
            node.with_child(Node::new(NodeKind::Data).with_attr("value", *value))
        })
    }

    #[test]
    fn swap_always_exchanges_distinct_children() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..200 {
            let mut node = block(&["01", "02"]);
            if mutate_children(&mut rng, &mut node) == Some(StructureMutation::Swap) {
                assert_eq!(node.children[0].attr("value"), Some("02"));
                assert_eq!(node.children[1].attr("value"), Some("01"));
            }
        }
    }

    #[test]
    fn delete_and_duplicate_change_child_count() {
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..200 {
            let mut node = block(&["01", "02", "03"]);
            match mutate_children(&mut rng, &mut node) {
                Some(StructureMutation::Delete) => assert_eq!(node.children.len(), 2),
                Some(StructureMutation::Duplicate) => assert_eq!(node.children.len(), 4),
                Some(StructureMutation::Swap) => assert_eq!(node.children.len(), 3),
                None => unreachable!(),
            }
        }
    }

    #[test]
    fn single_child_is_never_swapped() {
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..100 {
            let mut node = block(&["01"]);
            assert_ne!(mutate_children(&mut rng, &mut node), Some(StructureMutation::Swap));
        }
        assert_eq!(mutate_children(&mut rng, &mut Node::new(NodeKind::Block)), None);
    }

    #[test]
    fn effective_delays_stay_within_sentinels() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut diff = 0;
        let base = 100;
        for _ in 0..1000 {
            diff = sample_delay(&mut rng, base, diff);
            let effective = base + diff;
            assert!(
                (i64::from(SKIP_DELAY)..=i64::from(ABORT_DELAY)).contains(&effective),
                "{effective}"
            );
        }
    }

    #[test]
    fn tiny_delays_widen_instead_of_panicking() {
        let mut rng = StdRng::seed_from_u64(0);
        let diff = sample_delay(&mut rng, 0, 0);
        assert_eq!(diff, i64::from(SKIP_DELAY));
    }

    #[test]
    fn extreme_base_delays_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(0);
        for base in [i64::MAX, 0, 1500] {
            for _ in 0..50 {
                let diff = sample_delay(&mut rng, base, 0);
                let effective = base + diff;
                assert!((i64::from(SKIP_DELAY)..=i64::from(ABORT_DELAY)).contains(&effective));
            }
        }
    }
}
