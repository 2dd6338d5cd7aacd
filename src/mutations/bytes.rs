use rand::Rng;

use crate::config::{ARITH_MAX, OVERFLOW_CAP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMutation {
    Flip,
    Arithmetic,
    Swap,
    Delete,
    Duplicate,
    Insert,
    Overflow,
}

impl DataMutation {
    const ALL: [DataMutation; 7] = [
        DataMutation::Flip,
        DataMutation::Arithmetic,
        DataMutation::Swap,
        DataMutation::Delete,
        DataMutation::Duplicate,
        DataMutation::Insert,
        DataMutation::Overflow,
    ];

    pub fn changes_length(self) -> bool {
        matches!(
            self,
            DataMutation::Delete
                | DataMutation::Duplicate
                | DataMutation::Insert
                | DataMutation::Overflow
        )
    }
}

/// Applies one randomly chosen byte-level mutation. Returns `None` when the
/// attempt was a no-op (an overflow that would exceed the cap).
pub fn mutate_bytes<R: Rng + ?Sized>(rng: &mut R, data: &mut Vec<u8>) -> Option<DataMutation> {
    let action = if data.is_empty() {
        DataMutation::Insert
    } else {
        DataMutation::ALL[rng.gen_range(0..DataMutation::ALL.len())]
    };
    let len = data.len();
    match action {
        DataMutation::Flip => flip_bit(data, rng.gen_range(0..len), rng.gen_range(0..8)),
        DataMutation::Arithmetic => {
            let delta = rng.gen_range(-ARITH_MAX..=ARITH_MAX);
            add_to_byte(data, rng.gen_range(0..len), delta);
        }
        DataMutation::Swap => data.swap(rng.gen_range(0..len), rng.gen_range(0..len)),
        DataMutation::Delete => {
            data.remove(rng.gen_range(0..len));
        }
        DataMutation::Duplicate => {
            let index = rng.gen_range(0..len);
            data.insert(index, data[index]);
        }
        DataMutation::Insert => data.insert(rng.gen_range(0..=len), rng.gen()),
        DataMutation::Overflow => {
            if !overflow(data, 1 << rng.gen_range(3..=11)) {
                return None;
            }
        }
    }
    Some(action)
}

pub fn flip_bit(data: &mut [u8], index: usize, bit: u32) {
    data[index] ^= 1 << bit;
}

pub fn add_to_byte(data: &mut [u8], index: usize, delta: i64) {
    data[index] = data[index].wrapping_add(delta as i8 as u8);
}

/// Repeats the whole value `times` times unless that exceeds the cap.
pub fn overflow(data: &mut Vec<u8>, times: usize) -> bool {
    if data.len() * times > OVERFLOW_CAP {
        return false;
    }
    *data = data.repeat(times);
    true
}
