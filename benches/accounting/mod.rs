//! Benchmarks for the bitmap walks a collection cycle spends its time in.

use criterion::{black_box, Criterion};
use gcservice::accounting::card_table::CARD_AGED;
use gcservice::accounting::{CardTable, SpaceBitmap};
use gcservice::Address;
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;

const HEAP_BEGIN: Address = unsafe { Address::from_usize(0x4000_0000) };
const HEAP_BYTES: usize = 4 << 20;
const ALIGN: usize = 8;
/// Set this many distinct bits in the bitmap.
const NUM_OBJECTS: usize = 20_000;

/// Get a deterministic seeded Rng.
fn get_rng() -> StdRng {
    const SEED64: u64 = 0x4050cb1b5ab26c70;
    StdRng::seed_from_u64(SEED64)
}

fn make_bitmap(name: &str, rng: &mut StdRng) -> SpaceBitmap {
    let bitmap = SpaceBitmap::create(name, HEAP_BEGIN, HEAP_BYTES, ALIGN);
    for slot in (0..HEAP_BYTES / ALIGN).choose_multiple(rng, NUM_OBJECTS) {
        bitmap.set(HEAP_BEGIN + slot * ALIGN);
    }
    bitmap
}

pub fn bench(c: &mut Criterion) {
    let mut rng = get_rng();
    let live = make_bitmap("live", &mut rng);
    let mark = make_bitmap("mark", &mut rng);

    c.bench_function("visit_marked_range", |b| {
        b.iter(|| {
            let mut visited = 0usize;
            live.visit_marked_range(HEAP_BEGIN, HEAP_BEGIN + HEAP_BYTES, |_| visited += 1);
            black_box(visited)
        })
    });

    c.bench_function("sweep_walk", |b| {
        b.iter(|| {
            let mut swept = 0usize;
            SpaceBitmap::sweep_walk(&live, &mark, HEAP_BEGIN, HEAP_BEGIN + HEAP_BYTES, 4096, |objects| {
                swept += objects.len()
            });
            black_box(swept)
        })
    });

    let card_table = CardTable::create(HEAP_BEGIN, HEAP_BYTES);
    let num_dirty = card_table.num_cards() / 16;
    for card in (0..card_table.num_cards()).choose_multiple(&mut rng, num_dirty) {
        card_table.mark_card(HEAP_BEGIN + card * gcservice::accounting::card_table::BYTES_IN_CARD);
    }
    c.bench_function("card_table_scan", |b| {
        b.iter(|| {
            let mut visited = 0usize;
            card_table.scan(&live, HEAP_BEGIN, HEAP_BEGIN + HEAP_BYTES, |_| visited += 1, CARD_AGED);
            black_box(visited)
        })
    });
}
