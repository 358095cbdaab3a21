//! Seed-keyed sampling orders.
//!
//! Each collection's audit order is a Fisher–Yates shuffle of its
//! manifest, fed by the counter-mode PRNG in the collection's own domain.
//! The permutation depends only on `(seed, pbcid, N, manifest order)`, so
//! it is computed once at audit setup and every stage merely consumes a
//! longer prefix of it.

use crate::manifest::Manifest;
use crate::rng::AuditRng;

/// The manifest indices of `manifest.entries`, in sampling order.
pub fn sampling_order(seed: &str, manifest: &Manifest) -> Vec<usize> {
    let n = manifest.size();
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = AuditRng::new(seed, &manifest.pbcid);
    for i in (1..n).rev() {
        let j = rng.uniform_int(0, i as u64) as usize;
        order.swap(i, j);
    }
    order
}

/// The bids of a collection's sampling order, in order.
pub fn ordered_bids<'a>(manifest: &'a Manifest, order: &[usize]) -> Vec<&'a str> {
    order
        .iter()
        .map(|&i| manifest.entries[i].bid.as_str())
        .collect()
}
