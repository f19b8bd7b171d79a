use criterion::{Criterion, black_box, criterion_group, criterion_main};
use etude::DateHeaderCache;

fn bench_date(c: &mut Criterion) {
    let cache = DateHeaderCache::start().unwrap();

    c.bench_function("date_cache_current", |b| {
        b.iter(|| black_box(cache.current()));
    });

    c.bench_function("date_format_uncached", |b| {
        b.iter(|| black_box(httpdate::fmt_http_date(std::time::SystemTime::now())));
    });

    cache.stop();
}

criterion_group!(benches, bench_date);
criterion_main!(benches);
