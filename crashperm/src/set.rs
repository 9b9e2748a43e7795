//! Random subset selection for the sampling strategies.

use bitvec::vec::BitVec;

/// Draw a bitvec of `len` independent fair coin flips.
fn random_bitvec(rng: &mut fastrand::Rng, len: usize) -> BitVec {
    let words = (len + usize::BITS as usize - 1) / usize::BITS as usize;
    let mut bits = BitVec::from_vec((0..words).map(|_| rng.usize(..)).collect());
    bits.truncate(len);
    bits
}

/// Pick a random subset of `items`, keeping their relative order.
pub fn random_subset<T: Copy>(rng: &mut fastrand::Rng, items: &[T]) -> Vec<T> {
    random_bitvec(rng, items.len())
        .iter_ones()
        .map(|idx| items[idx])
        .collect()
}
