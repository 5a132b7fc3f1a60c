use std::sync::{Arc, Mutex};

use strato_memory::{
    DirtyClients, MemoryListener, MemoryTopology, RamBlock, RamFlags, Section,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Begin,
    Commit,
    Add(u64, u64),
    Del(u64, u64),
    LogStart(u64, u64, u8),
    LogStop(u64, u64, u8),
    LogSync(u64, u64),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn push(&self, e: Event) {
        self.events.lock().unwrap().push(e);
    }
}

impl MemoryListener for Recorder {
    fn begin(&self) {
        self.push(Event::Begin);
    }
    fn commit(&self) {
        self.push(Event::Commit);
    }
    fn region_add(&self, s: &Section) {
        self.push(Event::Add(s.range.base, s.range.len));
    }
    fn region_del(&self, s: &Section) {
        self.push(Event::Del(s.range.base, s.range.len));
    }
    fn log_start(&self, s: &Section, _old: DirtyClients, new: DirtyClients) {
        self.push(Event::LogStart(s.range.base, s.range.len, new.bits()));
    }
    fn log_stop(&self, s: &Section, _old: DirtyClients, new: DirtyClients) {
        self.push(Event::LogStop(s.range.base, s.range.len, new.bits()));
    }
    fn log_sync(&self, s: &Section) {
        self.push(Event::LogSync(s.range.base, s.range.len));
    }
}

fn adds(events: &[Event]) -> Vec<(u64, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Add(b, l) => Some((*b, *l)),
            _ => None,
        })
        .collect()
}

fn dels(events: &[Event]) -> Vec<(u64, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Del(b, l) => Some((*b, *l)),
            _ => None,
        })
        .collect()
}

#[test]
fn listener_attach_replays_current_layout() {
    let mut topo = MemoryTopology::new();
    let root = topo.new_container("system", 1 << 32);
    let block = Arc::new(RamBlock::anonymous("ram", 0x10000, RamFlags::empty()).unwrap());
    let ram = topo.new_ram("ram", block);
    topo.add_subregion(root, 0x1000, ram).unwrap();
    let space = topo.create_address_space("cpu", root);

    let rec = Arc::new(Recorder::default());
    space.add_listener(rec.clone());

    let events = rec.take();
    assert_eq!(
        events,
        vec![Event::Begin, Event::Add(0x1000, 0x10000), Event::Commit]
    );
}

#[test]
fn attach_and_detach_produce_matching_notifications() {
    let mut topo = MemoryTopology::new();
    let root = topo.new_container("system", 1 << 32);
    let space = topo.create_address_space("cpu", root);
    let rec = Arc::new(Recorder::default());
    space.add_listener(rec.clone());
    rec.take();

    let r = topo.new_reservation("dev", 0x2000);
    topo.add_subregion(root, 0x8000, r).unwrap();
    let events = rec.take();
    assert_eq!(adds(&events), vec![(0x8000, 0x2000)]);
    assert!(dels(&events).is_empty());

    topo.del_subregion(root, r).unwrap();
    let events = rec.take();
    assert_eq!(dels(&events), vec![(0x8000, 0x2000)]);
    assert!(adds(&events).is_empty());
}

#[test]
fn unchanged_commit_is_silent() {
    let mut topo = MemoryTopology::new();
    let root = topo.new_container("system", 1 << 32);
    let r = topo.new_reservation("dev", 0x2000);
    topo.add_subregion(root, 0x8000, r).unwrap();
    let space = topo.create_address_space("cpu", root);
    let rec = Arc::new(Recorder::default());
    space.add_listener(rec.clone());
    rec.take();

    // Detach and re-attach identically inside one transaction: the batched
    // commit flattens once, the diff finds nothing, and listeners hear only
    // the bracketing begin/commit.
    topo.begin();
    topo.del_subregion(root, r).unwrap();
    topo.add_subregion(root, 0x8000, r).unwrap();
    topo.commit();

    let events = rec.take();
    assert!(adds(&events).is_empty(), "events: {events:?}");
    assert!(dels(&events).is_empty(), "events: {events:?}");
}

#[test]
fn batched_edits_produce_one_cycle() {
    let mut topo = MemoryTopology::new();
    let root = topo.new_container("system", 1 << 32);
    let space = topo.create_address_space("cpu", root);
    let rec = Arc::new(Recorder::default());
    space.add_listener(rec.clone());
    rec.take();

    topo.begin();
    for i in 0..4 {
        let r = topo.new_reservation(format!("r{i}"), 0x1000);
        topo.add_subregion(root, i * 0x10_0000, r).unwrap();
    }
    topo.commit();

    let events = rec.take();
    // Exactly one begin/commit bracket around all four additions.
    assert_eq!(
        events.iter().filter(|e| **e == Event::Begin).count(),
        1,
        "events: {events:?}"
    );
    assert_eq!(events.iter().filter(|e| **e == Event::Commit).count(), 1);
    assert_eq!(adds(&events).len(), 4);
}

#[test]
fn dirty_log_toggles_surface_as_transitions_not_remaps() {
    let mut topo = MemoryTopology::new();
    let root = topo.new_container("system", 1 << 32);
    let block = Arc::new(RamBlock::anonymous("ram", 0x4000, RamFlags::empty()).unwrap());
    let ram = topo.new_ram("ram", block);
    topo.add_subregion(root, 0, ram).unwrap();
    let space = topo.create_address_space("cpu", root);
    let rec = Arc::new(Recorder::default());
    space.add_listener(rec.clone());
    rec.take();

    topo.set_log_clients(ram, DirtyClients::MIGRATION).unwrap();
    let events = rec.take();
    assert!(adds(&events).is_empty(), "events: {events:?}");
    assert!(dels(&events).is_empty(), "events: {events:?}");
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::LogStart(0, 0x4000, _)))
            .count(),
        1,
        "events: {events:?}"
    );

    topo.set_log_clients(ram, DirtyClients::empty()).unwrap();
    let events = rec.take();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::LogStop(0, 0x4000, _)))
            .count(),
        1,
        "events: {events:?}"
    );
}

#[test]
fn log_sync_visits_logged_sections_only() {
    let mut topo = MemoryTopology::new();
    let root = topo.new_container("system", 1 << 32);
    let block_a = Arc::new(RamBlock::anonymous("a", 0x1000, RamFlags::empty()).unwrap());
    let block_b = Arc::new(RamBlock::anonymous("b", 0x1000, RamFlags::empty()).unwrap());
    let a = topo.new_ram("a", block_a);
    let b = topo.new_ram("b", block_b);
    topo.add_subregion(root, 0, a).unwrap();
    topo.add_subregion(root, 0x10000, b).unwrap();
    topo.set_log_clients(a, DirtyClients::MIGRATION).unwrap();
    let space = topo.create_address_space("cpu", root);
    let rec = Arc::new(Recorder::default());
    space.add_listener(rec.clone());
    rec.take();

    space.log_sync();
    let events = rec.take();
    assert_eq!(events, vec![Event::LogSync(0, 0x1000)]);
}

#[test]
fn flat_ranges_snapshot_tracks_commits() {
    let mut topo = MemoryTopology::new();
    let root = topo.new_container("system", 1 << 32);
    let block = Arc::new(RamBlock::anonymous("ram", 0x4000, RamFlags::empty()).unwrap());
    let ram = topo.new_ram("ram", block);
    topo.add_subregion(root, 0x1000, ram).unwrap();
    let space = topo.create_address_space("cpu", root);

    let before = space.flat_ranges();
    assert_eq!(before.ranges().len(), 1);
    assert_eq!(before.ranges()[0].range.base, 0x1000);
    assert_eq!(before.ranges()[0].region, ram);

    // Snapshots are immutable: later commits do not disturb them.
    let dev = topo.new_reservation("dev", 0x1000);
    topo.add_subregion(root, 0x10_0000, dev).unwrap();
    assert_eq!(before.ranges().len(), 1);
    assert_eq!(space.flat_ranges().ranges().len(), 2);
}

#[test]
fn resize_notifies_the_size_change() {
    let mut topo = MemoryTopology::new();
    let root = topo.new_container("system", 1 << 32);
    let block = Arc::new(
        RamBlock::anonymous_resizeable("ram", 0x2000, 0x8000, RamFlags::RESIZEABLE).unwrap(),
    );
    let ram = topo.new_ram("ram", block);
    topo.add_subregion(root, 0, ram).unwrap();
    let space = topo.create_address_space("cpu", root);
    let rec = Arc::new(Recorder::default());
    space.add_listener(rec.clone());
    rec.take();

    topo.resize_ram(ram, 0x8000).unwrap();
    let events = rec.take();
    assert_eq!(dels(&events), vec![(0, 0x2000)]);
    assert_eq!(adds(&events), vec![(0, 0x8000)]);
}
