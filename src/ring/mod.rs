use std::hash::Hasher;

use fnv::FnvHasher;
use ustr::Ustr;

/// Virtual points per unit of member weight.
pub const DEFAULT_REPLICAS: u32 = 100;

/// Anything that can be placed on a [`HashRing`].
pub trait RingMember {
    fn ring_id(&self) -> Ustr;

    fn ring_weight(&self) -> u32 {
        1
    }
}

impl RingMember for Ustr {
    fn ring_id(&self) -> Ustr {
        *self
    }
}

/// A virtual point: position on the ring and index of the owning member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEntry {
    pub hash: u64,
    pub member: usize,
}

/// Position of `key` on the ring: 64 bit FNV-1a followed by a finaliser so
/// that near identical inputs ("node-1", "node-2") spread over the whole ring.
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    mix(hasher.finish())
}

#[inline]
fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Weighted consistent hash ring.
///
/// Immutable once built: a topology change builds a new ring which is then
/// swapped in as a whole by its owner.
#[derive(Debug, Clone)]
pub struct HashRing<M> {
    members: Vec<M>,
    entries: Vec<RingEntry>,
}

impl<M> HashRing<M>
where
    M: RingMember + Clone,
{
    pub fn new(members: Vec<M>, replicas: u32) -> Self {
        let ids: Vec<Ustr> = members.iter().map(RingMember::ring_id).collect();
        let points: usize = members
            .iter()
            .map(|m| (replicas.saturating_mul(m.ring_weight().max(1))) as usize)
            .sum();

        let mut entries = Vec::with_capacity(points);
        for (idx, member) in members.iter().enumerate() {
            let id = ids[idx];
            for replica in 0..replicas.saturating_mul(member.ring_weight().max(1)) {
                let point = format!("{id}-{replica}");
                entries.push(RingEntry {
                    hash: hash_key(point.as_bytes()),
                    member: idx,
                });
            }
        }

        //Colliding points are ordered by member id so the ring does not depend on insertion order
        entries.sort_unstable_by(|a, b| {
            a.hash
                .cmp(&b.hash)
                .then_with(|| ids[a.member].as_str().cmp(ids[b.member].as_str()))
        });

        HashRing { members, entries }
    }

    /// Up to `count` distinct members, walking clockwise from the position of `key`.
    ///
    /// Asking for more members than the ring holds returns every member once.
    pub fn resolve(&self, key: &[u8], count: usize) -> Vec<M> {
        self.resolve_indices(key, count)
            .into_iter()
            .map(|idx| self.members[idx].clone())
            .collect()
    }

    fn resolve_indices(&self, key: &[u8], count: usize) -> Vec<usize> {
        let wanted = count.min(self.members.len());
        let mut picked = Vec::with_capacity(wanted);
        if wanted == 0 || self.entries.is_empty() {
            return picked;
        }

        let position = hash_key(key);
        let start = self.entries.partition_point(|entry| entry.hash < position);

        for entry in self
            .entries
            .iter()
            .cycle()
            .skip(start)
            .take(self.entries.len())
        {
            if !picked.contains(&entry.member) {
                picked.push(entry.member);
                if picked.len() == wanted {
                    break;
                }
            }
        }
        picked
    }

    #[inline]
    pub fn members(&self) -> &[M] {
        &self.members
    }

    #[inline]
    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
