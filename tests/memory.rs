//! Heap behavior observed through a loaded image: scavenging, tenuring,
//! weak references, ephemerons, the remembered set, and become.

use std::sync::Arc;

use broth_vm::consts::{EPHEMERON_CID, LARGE_ALLOCATION};
use broth_vm::error::GcReason;
use broth_vm::heap::{Allocator, HandleScope};
use broth_vm::isolate::Isolate;
use broth_vm::object::{string_hash, Array, Bytes, Ephemeron, Obj, WeakArray};
use broth_vm::util::test_helpers::build_test_image;

fn minimal_isolate() -> Box<Isolate> {
    let image = build_test_image(vec![]);
    Isolate::new(Arc::new(image)).expect("image loads")
}

#[test]
fn cons_chain_survives_scavenge_and_garbage_is_reclaimed() {
    let mut isolate = minimal_isolate();

    // Build 10_000 pairs, each holding its index and the previous pair.
    let mut head = isolate.heap().allocate_array(2, Allocator::Normal);
    Array::cast(head).init_element(0, Obj::smi(0));
    Array::cast(head).init_element(1, Obj::smi(0));
    for i in 1..10_000_isize {
        let pair;
        {
            let _h1 = HandleScope::new(isolate.heap(), &mut head);
            pair = isolate.heap().allocate_array(2, Allocator::Normal);
        }
        let view = Array::cast(pair);
        view.init_element(0, Obj::smi(i));
        view.set_element(isolate.heap(), 1, head);
        head = pair;
    }

    {
        let _h1 = HandleScope::new(isolate.heap(), &mut head);
        isolate.heap().scavenge(GcReason::Primitive);
    }
    let live_size = isolate.heap().size();

    // Every link is intact, newest to oldest.
    let mut cursor = head;
    let mut expected = 9_999_isize;
    loop {
        let pair = Array::cast(cursor);
        assert_eq!(pair.element(0), Obj::smi(expected));
        let next = pair.element(1);
        if next == Obj::smi(0) {
            break;
        }
        expected -= 1;
        cursor = next;
    }
    assert_eq!(expected, 0);

    // Unreferenced intermediates disappear at the next scavenge.
    for _ in 0..1_000 {
        let _h1 = HandleScope::new(isolate.heap(), &mut head);
        isolate.heap().allocate_array(8, Allocator::Normal);
    }
    let with_garbage = isolate.heap().size();
    {
        let _h1 = HandleScope::new(isolate.heap(), &mut head);
        isolate.heap().scavenge(GcReason::Primitive);
    }
    assert!(isolate.heap().size() < with_garbage);
    assert!(isolate.heap().size() <= live_size + LARGE_ALLOCATION);
}

#[test]
fn large_allocations_go_straight_to_old_space() {
    let mut isolate = minimal_isolate();
    let heap = isolate.heap();

    let small = heap.allocate_byte_array(1024, Allocator::Normal);
    assert!(small.is_new_object());

    let large = heap.allocate_byte_array(LARGE_ALLOCATION, Allocator::Normal);
    assert!(large.is_old_object());
}

#[test]
fn weak_array_slots_clear_when_targets_die() {
    let mut isolate = minimal_isolate();

    let mut weak = isolate.heap().allocate_weak_array(2, Allocator::Normal);
    let nil = isolate.interpreter().nil_obj();
    WeakArray::cast(weak).init_element(0, nil);
    WeakArray::cast(weak).init_element(1, nil);

    let mut survivor;
    {
        let _h1 = HandleScope::new(isolate.heap(), &mut weak);
        survivor = isolate.heap().allocate_array(1, Allocator::Normal);
        Array::cast(survivor).init_element(0, Obj::smi(17));
    }
    let doomed;
    {
        let _h1 = HandleScope::new(isolate.heap(), &mut weak);
        let _h2 = HandleScope::new(isolate.heap(), &mut survivor);
        doomed = isolate.heap().allocate_array(0, Allocator::Normal);
    }
    WeakArray::cast(weak).set_element(isolate.heap(), 0, survivor);
    WeakArray::cast(weak).set_element(isolate.heap(), 1, doomed);

    {
        let _h1 = HandleScope::new(isolate.heap(), &mut weak);
        let _h2 = HandleScope::new(isolate.heap(), &mut survivor);
        isolate.heap().scavenge(GcReason::Primitive);
    }

    let weak = WeakArray::cast(weak);
    assert_eq!(weak.element(0), survivor);
    assert_eq!(Array::cast(weak.element(0)).element(0), Obj::smi(17));
    assert_eq!(weak.element(1), isolate.interpreter().nil_obj());
}

#[test]
fn ephemerons_mourn_unreachable_keys_and_keep_reachable_ones() {
    let mut isolate = minimal_isolate();
    let nil = isolate.interpreter().nil_obj();

    // Reachable key: the ephemeron's slots survive.
    let mut kept =
        isolate
            .heap()
            .allocate_regular_object(EPHEMERON_CID, 3, Allocator::Normal);
    {
        let view = Ephemeron::cast(kept);
        view.set_key_no_barrier(nil);
        view.set_value_no_barrier(nil);
        view.set_finalizer_no_barrier(nil);
    }
    let mut key;
    {
        let _h1 = HandleScope::new(isolate.heap(), &mut kept);
        key = isolate.heap().allocate_array(0, Allocator::Normal);
    }
    let value;
    {
        let _h1 = HandleScope::new(isolate.heap(), &mut kept);
        let _h2 = HandleScope::new(isolate.heap(), &mut key);
        value = isolate.heap().allocate_array(1, Allocator::Normal);
        Array::cast(value).init_element(0, Obj::smi(5));
    }
    Ephemeron::cast(kept).set_key(isolate.heap(), key);
    Ephemeron::cast(kept).set_value(isolate.heap(), value);

    {
        let _h1 = HandleScope::new(isolate.heap(), &mut kept);
        let _h2 = HandleScope::new(isolate.heap(), &mut key);
        isolate.heap().scavenge(GcReason::Primitive);
    }
    let kept_view = Ephemeron::cast(kept);
    assert_eq!(kept_view.key(), key);
    assert!(kept_view.value().is_array());
    assert_eq!(Array::cast(kept_view.value()).element(0), Obj::smi(5));

    // Unreachable key: key, value, and finalizer are mourned to nil.
    let mut mourned =
        isolate
            .heap()
            .allocate_regular_object(EPHEMERON_CID, 3, Allocator::Normal);
    {
        let view = Ephemeron::cast(mourned);
        view.set_key_no_barrier(nil);
        view.set_value_no_barrier(nil);
        view.set_finalizer_no_barrier(nil);
    }
    {
        let _h1 = HandleScope::new(isolate.heap(), &mut mourned);
        let doomed_key = isolate.heap().allocate_array(0, Allocator::Normal);
        let view = Ephemeron::cast(mourned);
        view.set_key(isolate.heap(), doomed_key);
        view.set_value(isolate.heap(), doomed_key);
    }
    {
        let _h1 = HandleScope::new(isolate.heap(), &mut mourned);
        isolate.heap().scavenge(GcReason::Primitive);
    }
    let nil = isolate.interpreter().nil_obj();
    let mourned_view = Ephemeron::cast(mourned);
    assert_eq!(mourned_view.key(), nil);
    assert_eq!(mourned_view.value(), nil);
    assert_eq!(mourned_view.finalizer(), nil);
}

#[test]
fn old_objects_with_new_children_enter_the_remembered_set() {
    let mut isolate = minimal_isolate();
    let heap = isolate.heap();

    // Big enough for a dedicated old-space region.
    let old = heap.allocate_array(LARGE_ALLOCATION / 8, Allocator::Normal);
    assert!(old.is_old_object());
    let old_view = Array::cast(old);
    let nil = isolate.interpreter().nil_obj();
    for i in 0..old_view.len() {
        old_view.init_element(i, nil);
    }

    let child = isolate.heap().allocate_array(1, Allocator::Normal);
    assert!(child.is_new_object());
    Array::cast(child).init_element(0, Obj::smi(23));

    old_view.set_element(isolate.heap(), 0, child);
    assert!(old.is_remembered());

    // The remembered set roots the child through the scavenge; the slot
    // follows the copy.
    isolate.heap().scavenge(GcReason::Primitive);
    let copied = Array::cast(old).element(0);
    assert!(copied.is_heap_object());
    assert_eq!(Array::cast(copied).element(0), Obj::smi(23));
}

#[test]
fn become_swaps_identities_and_hashes() {
    let mut isolate = minimal_isolate();
    let heap = isolate.heap();

    // No collections run during this test's allocations, so locals are
    // stable.
    let container = Array::cast(heap.allocate_array(4, Allocator::Normal));
    let a = heap.allocate_array(1, Allocator::Normal);
    let b = heap.allocate_array(1, Allocator::Normal);
    let c = heap.allocate_array(1, Allocator::Normal);
    let d = heap.allocate_array(1, Allocator::Normal);
    container.init_element(0, a);
    container.init_element(1, b);
    container.init_element(2, c);
    container.init_element(3, d);

    Array::cast(a).init_element(0, b); // a.x = b
    Array::cast(b).init_element(0, Obj::smi(0));
    Array::cast(c).init_element(0, d); // c.x = d
    Array::cast(d).init_element(0, Obj::smi(0));

    a.set_header_hash(111);
    b.set_header_hash(222);

    let olds = Array::cast(heap.allocate_array(2, Allocator::Normal));
    olds.init_element(0, a);
    olds.init_element(1, b);
    let news = Array::cast(heap.allocate_array(2, Allocator::Normal));
    news.init_element(0, c);
    news.init_element(1, d);

    assert!(heap.become_forward(olds.obj(), news.obj()));

    // References formerly to a and b now reach c and d.
    assert_eq!(container.element(0), c);
    assert_eq!(container.element(1), d);
    assert_eq!(container.element(2), c);
    assert_eq!(container.element(3), d);

    // What was a is now c, and its x is d.
    assert_eq!(Array::cast(container.element(0)).element(0), d);

    // The survivors carry the forwarders' identity hashes.
    assert_eq!(c.header_hash(), 111);
    assert_eq!(d.header_hash(), 222);
}

#[test]
fn become_rejects_mismatched_or_immediate_pairs() {
    let mut isolate = minimal_isolate();
    let heap = isolate.heap();

    let one = Array::cast(heap.allocate_array(1, Allocator::Normal));
    let two = Array::cast(heap.allocate_array(2, Allocator::Normal));
    let target = heap.allocate_array(0, Allocator::Normal);
    one.init_element(0, target);
    two.init_element(0, target);
    two.init_element(1, Obj::smi(1));

    // Length mismatch.
    assert!(!heap.become_forward(one.obj(), two.obj()));

    // Immediate element.
    let smis = Array::cast(heap.allocate_array(1, Allocator::Normal));
    smis.init_element(0, Obj::smi(3));
    let objs = Array::cast(heap.allocate_array(1, Allocator::Normal));
    objs.init_element(0, target);
    assert!(!heap.become_forward(smis.obj(), objs.obj()));
}

#[test]
fn string_hashes_are_stable_across_collection() {
    let mut isolate = minimal_isolate();
    let salt = isolate.salt();

    let mut string = isolate.heap().allocate_string(3, Allocator::Normal);
    Bytes::cast(string).copy_from(b"abc");
    let hash = Bytes::cast(string).ensure_hash(salt);
    assert_eq!(hash as usize, string_hash(b"abc", salt));

    {
        let _h1 = HandleScope::new(isolate.heap(), &mut string);
        isolate.heap().scavenge(GcReason::Primitive);
    }
    assert_eq!(Bytes::cast(string).ensure_hash(salt), hash);

    {
        let _h1 = HandleScope::new(isolate.heap(), &mut string);
        isolate.heap().collect_all(GcReason::Primitive);
    }
    assert_eq!(Bytes::cast(string).ensure_hash(salt), hash);
}
