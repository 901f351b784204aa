//! Abstract cache states for one cache row.
//!
//! The three age-based domains of LRU cache analysis. Ages range over
//! `[0, A]` where `A` is the associativity; age `A` means "not present".
//! MUST keeps an upper bound on the age of blocks guaranteed present
//! (join is pointwise max), MAY a lower bound on the age of blocks
//! possibly present (join is pointwise min), PERSISTENCE a stack of
//! per-loop-context items tracking whether a block can have been evicted
//! since the context was entered.

/// MUST domain: `age[i] < A` means block `i` is guaranteed in the row with
/// at most that age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MustAcs {
    assoc: u32,
    age: Vec<u32>,
}

impl MustAcs {
    /// All ages at `init`; `bottom()` and `top()` pick the right value.
    pub fn new(size: usize, assoc: usize, init: u32) -> Self {
        Self {
            assoc: assoc as u32,
            age: vec![init; size],
        }
    }

    /// Join-neutral element.
    pub fn bottom(size: usize, assoc: usize) -> Self {
        Self::new(size, assoc, 0)
    }

    /// Nothing guaranteed present.
    pub fn top(size: usize, assoc: usize) -> Self {
        let a = assoc as u32;
        Self::new(size, assoc, a)
    }

    pub fn len(&self) -> usize {
        self.age.len()
    }

    pub fn is_empty(&self) -> bool {
        self.age.is_empty()
    }

    pub fn assoc(&self) -> u32 {
        self.assoc
    }

    pub fn contains(&self, id: usize) -> bool {
        self.age[id] != self.assoc
    }

    pub fn age(&self, id: usize) -> u32 {
        self.age[id]
    }

    pub fn set_age(&mut self, id: usize, age: u32) {
        debug_assert!(age <= self.assoc);
        self.age[id] = age;
    }

    /// LRU access to block `id`: blocks younger than it age by one, the
    /// accessed block rejuvenates to age 0.
    pub fn inject(&mut self, id: usize) {
        if self.contains(id) {
            let pivot = self.age[id];
            for a in self.age.iter_mut() {
                if *a < pivot {
                    *a += 1;
                }
            }
        } else {
            for a in self.age.iter_mut() {
                if *a != self.assoc {
                    *a += 1;
                }
            }
        }
        self.age[id] = 0;
    }

    /// Pointwise max: keeps only what both paths guarantee.
    pub fn lub(&mut self, other: &Self) {
        debug_assert_eq!(self.age.len(), other.age.len());
        for (a, &b) in self.age.iter_mut().zip(other.age.iter()) {
            if *a < b {
                *a = b;
            }
        }
    }

    /// Partial order of the lattice: ages grow toward top, so `self ⊑
    /// other` holds when every age of `self` is at most the other's.
    pub fn le(&self, other: &Self) -> bool {
        self.age.iter().zip(other.age.iter()).all(|(a, b)| a <= b)
    }
}

/// MAY domain: `age[i] < A` means block `i` may be present with at least
/// that age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MayAcs {
    assoc: u32,
    age: Vec<u32>,
}

impl MayAcs {
    pub fn new(size: usize, assoc: usize, init: u32) -> Self {
        Self {
            assoc: assoc as u32,
            age: vec![init; size],
        }
    }

    /// Join-neutral element: nothing possibly present.
    pub fn bottom(size: usize, assoc: usize) -> Self {
        let a = assoc as u32;
        Self::new(size, assoc, a)
    }

    /// Everything may be present with age 0.
    pub fn top(size: usize, assoc: usize) -> Self {
        Self::new(size, assoc, 0)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.age[id] != self.assoc
    }

    pub fn age(&self, id: usize) -> u32 {
        self.age[id]
    }

    pub fn inject(&mut self, id: usize) {
        if self.contains(id) {
            let pivot = self.age[id];
            for a in self.age.iter_mut() {
                if *a <= pivot {
                    *a += 1;
                }
            }
        } else {
            for a in self.age.iter_mut() {
                if *a != self.assoc {
                    *a += 1;
                }
            }
        }
        self.age[id] = 0;
    }

    /// Pointwise min: anything either path may cache.
    pub fn lub(&mut self, other: &Self) {
        debug_assert_eq!(self.age.len(), other.age.len());
        for (a, &b) in self.age.iter_mut().zip(other.age.iter()) {
            if *a > b {
                *a = b;
            }
        }
    }
}

/// Bottom marker of persistence items.
const PERS_BOT: i32 = -1;

/// One persistence item: ages in `{-1} ∪ [0, A]`, where `-1` is unset and
/// `A` means "evicted at least once since the context was entered".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersItem {
    assoc: i32,
    age: Vec<i32>,
}

impl PersItem {
    pub fn new(size: usize, assoc: usize) -> Self {
        Self {
            assoc: assoc as i32,
            age: vec![PERS_BOT; size],
        }
    }

    pub fn contains(&self, id: usize) -> bool {
        self.age[id] != PERS_BOT
    }

    pub fn is_wiped(&self, id: usize) -> bool {
        self.age[id] == self.assoc
    }

    /// Persistent: touched since context entry and never evicted.
    pub fn is_persistent(&self, id: usize) -> bool {
        self.contains(id) && !self.is_wiped(id)
    }

    pub fn age(&self, id: usize) -> i32 {
        self.age[id]
    }

    /// Aging is bounded by the MUST state: when the accessed block is
    /// known present, only younger blocks age.
    pub fn inject(&mut self, must: &MustAcs, id: usize) {
        if must.contains(id) {
            let pivot = self.age[id];
            for a in self.age.iter_mut() {
                if *a < pivot && *a != PERS_BOT && *a != self.assoc {
                    *a += 1;
                }
            }
        } else {
            for a in self.age.iter_mut() {
                if *a != PERS_BOT && *a != self.assoc {
                    *a += 1;
                }
            }
        }
        self.age[id] = 0;
    }

    /// Max treating unset as neutral; an item never returns to unset.
    pub fn lub(&mut self, other: &Self) {
        for (a, &b) in self.age.iter_mut().zip(other.age.iter()) {
            if *a == PERS_BOT || (*a < b && b != PERS_BOT) {
                *a = b;
            }
        }
    }
}

/// PERSISTENCE domain: one item per entered loop context plus the whole
/// scope item. The domain has an explicit bottom used before any path
/// reaches a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersAcs {
    size: usize,
    assoc: usize,
    is_bottom: bool,
    whole: PersItem,
    items: Vec<PersItem>,
}

impl PersAcs {
    pub fn bottom(size: usize, assoc: usize) -> Self {
        Self {
            size,
            assoc,
            is_bottom: true,
            whole: PersItem::new(size, assoc),
            items: Vec::new(),
        }
    }

    /// Empty context stack, nothing recorded yet.
    pub fn top(size: usize, assoc: usize) -> Self {
        Self {
            size,
            assoc,
            is_bottom: false,
            whole: PersItem::new(size, assoc),
            items: Vec::new(),
        }
    }

    pub fn is_bottom(&self) -> bool {
        self.is_bottom
    }

    pub fn depth(&self) -> usize {
        self.items.len()
    }

    pub fn item(&self, level: usize) -> &PersItem {
        &self.items[level]
    }

    pub fn whole(&self) -> &PersItem {
        &self.whole
    }

    pub fn enter_context(&mut self) {
        debug_assert!(!self.is_bottom);
        self.items.push(PersItem::new(self.size, self.assoc));
    }

    pub fn leave_context(&mut self) {
        debug_assert!(!self.is_bottom);
        self.items.pop();
    }

    pub fn inject(&mut self, must: &MustAcs, id: usize) {
        debug_assert!(!self.is_bottom);
        for item in self.items.iter_mut() {
            item.inject(must, id);
        }
        self.whole.inject(must, id);
    }

    /// Stacks are aligned from the innermost end; unmatched outer items of
    /// the shorter side are dropped, so joining an entering edge never
    /// widens inner levels.
    pub fn lub(&mut self, other: &Self) {
        if other.is_bottom {
            return;
        }
        if self.is_bottom {
            *self = other.clone();
            return;
        }
        let keep = self.items.len().min(other.items.len());
        let drop = self.items.len() - keep;
        self.items.drain(0..drop);
        let off = other.items.len() - keep;
        for (i, item) in self.items.iter_mut().enumerate() {
            item.lub(&other.items[off + i]);
        }
        self.whole.lub(&other.whole);
    }

    /// Persistent at context level `level` (0 = outermost live context).
    pub fn is_persistent(&self, id: usize, level: usize) -> bool {
        !self.is_bottom && self.items[level].is_persistent(id)
    }
}

/// Composite domain running MUST, MAY and PERSISTENCE in lockstep; the
/// persistence aging consults the pre-access MUST state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acs {
    pub must: MustAcs,
    pub may: MayAcs,
    pub pers: PersAcs,
}

impl Acs {
    pub fn bottom(size: usize, assoc: usize) -> Self {
        Self {
            must: MustAcs::bottom(size, assoc),
            may: MayAcs::bottom(size, assoc),
            pers: PersAcs::bottom(size, assoc),
        }
    }

    pub fn top(size: usize, assoc: usize) -> Self {
        Self {
            must: MustAcs::top(size, assoc),
            may: MayAcs::top(size, assoc),
            pers: PersAcs::top(size, assoc),
        }
    }

    pub fn inject(&mut self, id: usize) {
        self.pers.inject(&self.must, id);
        self.must.inject(id);
        self.may.inject(id);
    }

    pub fn lub(&mut self, other: &Self) {
        self.must.lub(&other.must);
        self.may.lub(&other.may);
        self.pers.lub(&other.pers);
    }

    pub fn enter_context(&mut self) {
        self.pers.enter_context();
    }

    pub fn leave_context(&mut self) {
        self.pers.leave_context();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_must_inject_and_hit() {
        let mut must = MustAcs::top(3, 2);
        assert!(!must.contains(0));

        must.inject(0);
        assert!(must.contains(0));
        assert_eq!(must.age(0), 0);

        must.inject(1);
        assert_eq!(must.age(0), 1);
        assert_eq!(must.age(1), 0);

        // associativity 2: a third block evicts the oldest
        must.inject(2);
        assert!(!must.contains(0));
        assert!(must.contains(1));
        assert!(must.contains(2));
    }

    #[test]
    fn test_must_reaccess_keeps_others() {
        let mut must = MustAcs::top(3, 2);
        must.inject(0);
        must.inject(1);
        // re-access 1 (age 0): nothing else ages
        must.inject(1);
        assert_eq!(must.age(0), 1);
        assert_eq!(must.age(1), 0);
    }

    #[test]
    fn test_must_join_is_max() {
        let mut a = MustAcs::top(2, 2);
        let mut b = MustAcs::top(2, 2);
        a.inject(0); // a: age[0]=0
        b.inject(1);
        b.inject(0); // b: age[0]=0, age[1]=1

        let mut j = a.clone();
        j.lub(&b);
        assert_eq!(j.age(0), 0);
        // only b guarantees block 1
        assert!(!j.contains(1));
    }

    #[test]
    fn test_may_join_is_min() {
        let mut a = MayAcs::bottom(2, 2);
        let b = {
            let mut b = MayAcs::bottom(2, 2);
            b.inject(1);
            b
        };
        a.lub(&b);
        // present on one path: may be present
        assert!(a.contains(1));
        assert!(!a.contains(0));
    }

    #[test]
    fn test_pers_first_injection_leaves_bottom() {
        let must = MustAcs::top(2, 2);
        let mut item = PersItem::new(2, 2);
        assert!(!item.contains(0));

        item.inject(&must, 0);
        assert!(item.contains(0));
        assert!(item.is_persistent(0));
        // never returns to unset
        item.inject(&must, 1);
        assert!(item.contains(0));
    }

    #[test]
    fn test_pers_wiped_by_conflicts() {
        // associativity 1: the second block wipes the first
        let must = MustAcs::top(2, 1);
        let mut item = PersItem::new(2, 1);
        item.inject(&must, 0);
        item.inject(&must, 1);
        assert!(item.is_wiped(0));
        assert!(!item.is_persistent(0));
        assert!(item.is_persistent(1));
    }

    #[test]
    fn test_pers_context_stack() {
        let mut pers = PersAcs::top(2, 2);
        pers.enter_context();
        pers.enter_context();
        assert_eq!(pers.depth(), 2);

        let must = MustAcs::top(2, 2);
        pers.inject(&must, 0);
        assert!(pers.is_persistent(0, 0));
        assert!(pers.is_persistent(0, 1));
        assert!(pers.whole().is_persistent(0));

        pers.leave_context();
        assert_eq!(pers.depth(), 1);
    }

    #[test]
    fn test_pers_stack_alignment() {
        let mut inner = PersAcs::top(2, 2);
        inner.enter_context();
        inner.enter_context();
        let mut outer = PersAcs::top(2, 2);
        outer.enter_context();

        // join aligns from the innermost end and drops the unmatched outer
        inner.lub(&outer);
        assert_eq!(inner.depth(), 1);
    }

    #[test]
    fn test_pers_bottom_neutral() {
        let bot = PersAcs::bottom(2, 2);
        let mut x = PersAcs::top(2, 2);
        x.enter_context();
        let must = MustAcs::top(2, 2);
        x.inject(&must, 0);

        let saved = x.clone();
        x.lub(&bot);
        assert_eq!(x, saved);

        let mut y = PersAcs::bottom(2, 2);
        y.lub(&saved);
        assert_eq!(y, saved);
    }

    #[test]
    fn test_composite_lockstep() {
        let mut acs = Acs::top(2, 1);
        acs.enter_context();
        acs.inject(0);
        acs.inject(1); // wipes 0 at associativity 1

        assert!(!acs.must.contains(0));
        assert!(acs.must.contains(1));
        assert!(acs.pers.items[0].is_wiped(0));
        assert!(acs.pers.is_persistent(1, 0));
    }

    /// Join must be monotone in both arguments, and the transfer function
    /// monotone in the in-state. Checked over random MUST states.
    #[test]
    fn test_must_monotonicity_fuzz() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let size = 4;
        let assoc = 2;

        let random_state = |rng: &mut StdRng| {
            let mut s = MustAcs::top(size, assoc);
            for i in 0..size {
                s.set_age(i, rng.gen_range(0..=assoc as u32));
            }
            s
        };

        for _ in 0..500 {
            let a = random_state(&mut rng);
            let b = random_state(&mut rng);
            let c = random_state(&mut rng);

            // join is an upper bound of both arguments
            let mut j = a.clone();
            j.lub(&b);
            assert!(a.le(&j) && b.le(&j));

            // join monotone in its first argument: a ⊑ a ⊔ c implies
            // a ⊔ b ⊑ (a ⊔ c) ⊔ b
            let mut jc = a.clone();
            jc.lub(&c);
            let mut jcb = jc.clone();
            jcb.lub(&b);
            assert!(j.le(&jcb));

            // update monotone in the in-state
            let id = rng.gen_range(0..size);
            let mut ua = a.clone();
            ua.inject(id);
            let mut uj = j.clone();
            uj.inject(id);
            assert!(
                ua.le(&uj),
                "inject({}) not monotone: {:?} vs {:?}",
                id,
                ua,
                uj
            );
        }
    }
}
