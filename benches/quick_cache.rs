use criterion::Criterion;
use criterion::{criterion_group, criterion_main};

use quick_cache::sync::Cache;

use tokio::runtime;

use std::sync::OnceLock;

use refresh_ahead::constants_for_benchmarking::{GET_MANY, WARM_KEYS};

static CACHE: OnceLock<Cache<usize, usize>> = OnceLock::new();

async fn load(key: usize) -> Result<usize, ()> {
    Ok(key)
}

async fn get_hot() {
    let cache = CACHE.get().unwrap();

    for i in 0..GET_MANY {
        let key = i % WARM_KEYS;
        cache.get_or_insert_async(&key, load(key)).await.unwrap();
    }
}

async fn get_cold() {
    let cache = CACHE.get().unwrap();
    cache.clear();

    for i in 0..GET_MANY {
        cache.get_or_insert_async(&i, load(i)).await.unwrap();
    }
}

async fn change_notifications() {
    let cache = CACHE.get().unwrap();

    for i in 0..WARM_KEYS {
        cache.get_or_insert_async(&i, load(i)).await.unwrap();
    }

    for i in 0..WARM_KEYS {
        cache.remove(&i);
    }
}

fn bencher(c: &mut Criterion) {
    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    CACHE.get_or_init(|| Cache::new(GET_MANY));

    c.bench_function("quick cache get hot", |b| b.to_async(&rt).iter(get_hot));

    c.bench_function("quick cache get cold", |b| b.to_async(&rt).iter(get_cold));

    c.bench_function("quick cache change notifications", |b| {
        b.to_async(&rt).iter(change_notifications)
    });
}

criterion_group!(benches, bencher);
criterion_main!(benches);
