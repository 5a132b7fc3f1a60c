use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use strato_memory::{
    flatten, AddrRange, DispatchMap, MemoryTopology, RamBlock, RamFlags, RegionRegistry,
};

/// A PC-ish layout: low RAM, a few device windows, high RAM.
fn pc_layout(reg: &mut RegionRegistry) -> strato_memory::RegionId {
    let root = reg.new_container("system", 1u64 << 40);
    for (i, (base, size)) in [
        (0u64, 0xC000_0000u64),
        (0xFEE0_0000, 0x1000),
        (0xFED0_0000, 0x400),
        (0xE000_0000, 0x1000_0000),
        (0x1_0000_0000, 0x4000_0000),
    ]
    .into_iter()
    .enumerate()
    {
        let r = reg.new_reservation(format!("r{i}"), size);
        reg.add_subregion_overlap(root, base, r, i as i32).unwrap();
    }
    root
}

fn bench_trie_lookup(c: &mut Criterion) {
    let mut reg = RegionRegistry::new();
    let root = pc_layout(&mut reg);
    let view = flatten(&reg, root, AddrRange::MAX);
    let map = DispatchMap::build(&view);

    let probes = [
        0x1000u64,
        0xB000_0000,
        0xFEE0_0040,
        0xE800_0000,
        0x1_2000_0000,
        0xFFFF_F000,
    ];

    c.bench_function("dispatch_lookup_mixed", |b| {
        let mut i = 0;
        b.iter(|| {
            let addr = probes[i % probes.len()];
            i += 1;
            black_box(map.lookup(black_box(addr)))
        })
    });

    c.bench_function("dispatch_lookup_same_page", |b| {
        b.iter(|| black_box(map.lookup_section(black_box(0x1000)).0))
    });
}

fn bench_accessor_read(c: &mut Criterion) {
    let mut topo = MemoryTopology::new();
    let root = topo.new_container("system", 1u64 << 32);
    let block = Arc::new(RamBlock::anonymous("ram", 1 << 24, RamFlags::empty()).unwrap());
    let ram = topo.new_ram("ram", block);
    topo.add_subregion(root, 0, ram).unwrap();
    let space = topo.create_address_space("cpu", root);
    let acc = space.accessor();

    c.bench_function("accessor_read_u64_ram", |b| {
        b.iter(|| black_box(acc.read_u64(black_box(0x1_0000)).unwrap()))
    });

    let mut buf = [0u8; 4096];
    c.bench_function("accessor_read_page_ram", |b| {
        b.iter(|| {
            acc.read(
                black_box(0x2_0000),
                &mut buf,
                strato_memory::AccessAttrs::UNSPECIFIED,
            )
            .unwrap()
        })
    });
}

criterion_group!(benches, bench_trie_lookup, bench_accessor_read);
criterion_main!(benches);
