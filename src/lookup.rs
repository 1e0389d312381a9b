//! Inline method-lookup caches.
//!
//! Two open-addressed tables with two probes each. The ordinary cache
//! memoizes public sends by (class id, selector); the NS cache memoizes
//! self, super, outer, and implicit-receiver sends by (class id, selector,
//! calling method, rule), remembering the resolved receiver when it is not
//! the frame's own.
//!
//! Entries key on object addresses, so any event that can move methods or
//! change class identities (GC epilogue, become) must clear both tables.

use crate::consts::*;
use crate::object::Obj;

const CACHE_SIZE: usize = 256;
const CACHE_MASK: usize = CACHE_SIZE - 1;

const NS_CACHE_SIZE: usize = 128;
const NS_CACHE_MASK: usize = NS_CACHE_SIZE - 1;

#[derive(Clone, Copy)]
struct CacheEntry {
    cid: Cid,
    selector: Obj,
    target: Obj,
}

const EMPTY_ENTRY: CacheEntry = CacheEntry {
    cid: ILLEGAL_CID,
    selector: Obj::ZERO,
    target: Obj::ZERO,
};

#[derive(Clone, Copy)]
struct NsCacheEntry {
    cid: Cid,
    selector: Obj,
    caller: Obj,
    rule: LookupRule,
    absent_receiver: Option<Obj>,
    target: Obj,
}

const EMPTY_NS_ENTRY: NsCacheEntry = NsCacheEntry {
    cid: ILLEGAL_CID,
    selector: Obj::ZERO,
    caller: Obj::ZERO,
    rule: 0,
    absent_receiver: None,
    target: Obj::ZERO,
};

pub struct LookupCache {
    entries: [CacheEntry; CACHE_SIZE],
    ns_entries: [NsCacheEntry; NS_CACHE_SIZE],
}

fn ordinary_hash(cid: Cid, selector: Obj) -> usize {
    cid ^ (selector.raw() >> OBJECT_ALIGNMENT_LOG2)
}

fn ns_hash(cid: Cid, selector: Obj, caller: Obj, rule: LookupRule) -> usize {
    cid ^ (selector.raw() >> OBJECT_ALIGNMENT_LOG2)
        ^ (caller.raw() >> OBJECT_ALIGNMENT_LOG2)
        ^ rule
}

impl LookupCache {
    pub fn new() -> LookupCache {
        LookupCache {
            entries: [EMPTY_ENTRY; CACHE_SIZE],
            ns_entries: [EMPTY_NS_ENTRY; NS_CACHE_SIZE],
        }
    }

    pub fn lookup_ordinary(&self, cid: Cid, selector: Obj) -> Option<Obj> {
        let hash = ordinary_hash(cid, selector);

        let probe1 = &self.entries[hash & CACHE_MASK];
        if probe1.cid == cid && probe1.selector == selector {
            return Some(probe1.target);
        }

        let probe2 = &self.entries[(hash >> 3) & CACHE_MASK];
        if probe2.cid == cid && probe2.selector == selector {
            return Some(probe2.target);
        }

        None
    }

    pub fn insert_ordinary(&mut self, cid: Cid, selector: Obj, target: Obj) {
        let hash = ordinary_hash(cid, selector);
        let entry = CacheEntry {
            cid,
            selector,
            target,
        };

        let probe1 = hash & CACHE_MASK;
        if self.entries[probe1].cid == ILLEGAL_CID {
            self.entries[probe1] = entry;
            return;
        }

        let probe2 = (hash >> 3) & CACHE_MASK;
        if self.entries[probe2].cid == ILLEGAL_CID {
            self.entries[probe2] = entry;
            return;
        }

        self.entries[probe1] = entry;
    }

    /// Hit answers the resolved method and, when the send binds an
    /// enclosing object, the receiver the hit path must reconstruct.
    pub fn lookup_ns(
        &self,
        cid: Cid,
        selector: Obj,
        caller: Obj,
        rule: LookupRule,
    ) -> Option<(Option<Obj>, Obj)> {
        let hash = ns_hash(cid, selector, caller, rule);

        let probe1 = &self.ns_entries[hash & NS_CACHE_MASK];
        if probe1.cid == cid
            && probe1.selector == selector
            && probe1.caller == caller
            && probe1.rule == rule
        {
            return Some((probe1.absent_receiver, probe1.target));
        }

        let probe2 = &self.ns_entries[(hash >> 3) & NS_CACHE_MASK];
        if probe2.cid == cid
            && probe2.selector == selector
            && probe2.caller == caller
            && probe2.rule == rule
        {
            return Some((probe2.absent_receiver, probe2.target));
        }

        None
    }

    pub fn insert_ns(
        &mut self,
        cid: Cid,
        selector: Obj,
        caller: Obj,
        rule: LookupRule,
        absent_receiver: Option<Obj>,
        target: Obj,
    ) {
        let hash = ns_hash(cid, selector, caller, rule);
        let entry = NsCacheEntry {
            cid,
            selector,
            caller,
            rule,
            absent_receiver,
            target,
        };

        let probe1 = hash & NS_CACHE_MASK;
        if self.ns_entries[probe1].cid == ILLEGAL_CID {
            self.ns_entries[probe1] = entry;
            return;
        }

        let probe2 = (hash >> 3) & NS_CACHE_MASK;
        if self.ns_entries[probe2].cid == ILLEGAL_CID {
            self.ns_entries[probe2] = entry;
            return;
        }

        self.ns_entries[probe1] = entry;
    }

    pub fn clear(&mut self) {
        self.entries = [EMPTY_ENTRY; CACHE_SIZE];
        self.ns_entries = [EMPTY_NS_ENTRY; NS_CACHE_SIZE];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_obj(addr: usize) -> Obj {
        Obj::from_raw(addr | 1)
    }

    #[test]
    fn ordinary_hit_and_miss() {
        let mut cache = LookupCache::new();
        let selector = fake_obj(0x1000);
        let target = fake_obj(0x2000);

        assert_eq!(cache.lookup_ordinary(20, selector), None);
        cache.insert_ordinary(20, selector, target);
        assert_eq!(cache.lookup_ordinary(20, selector), Some(target));
        assert_eq!(cache.lookup_ordinary(21, selector), None);

        cache.clear();
        assert_eq!(cache.lookup_ordinary(20, selector), None);
    }

    #[test]
    fn ns_keys_distinguish_rule_and_caller() {
        let mut cache = LookupCache::new();
        let selector = fake_obj(0x1000);
        let caller_a = fake_obj(0x3000);
        let caller_b = fake_obj(0x4000);
        let target = fake_obj(0x2000);
        let receiver = fake_obj(0x5000);

        cache.insert_ns(20, selector, caller_a, RULE_SELF, None, target);
        assert_eq!(
            cache.lookup_ns(20, selector, caller_a, RULE_SELF),
            Some((None, target))
        );
        assert_eq!(cache.lookup_ns(20, selector, caller_b, RULE_SELF), None);
        assert_eq!(cache.lookup_ns(20, selector, caller_a, RULE_SUPER), None);

        cache.insert_ns(20, selector, caller_a, 2, Some(receiver), target);
        assert_eq!(
            cache.lookup_ns(20, selector, caller_a, 2),
            Some((Some(receiver), target))
        );
    }

    #[test]
    fn insert_overwrites_first_probe_when_full() {
        let mut cache = LookupCache::new();
        let selector = fake_obj(0x1000);
        // Both probes fill, then the third insert overwrites probe one;
        // the entry stays findable throughout.
        cache.insert_ordinary(30, selector, fake_obj(0x100));
        cache.insert_ordinary(30, selector, fake_obj(0x200));
        cache.insert_ordinary(30, selector, fake_obj(0x300));
        assert!(cache.lookup_ordinary(30, selector).is_some());
    }
}
