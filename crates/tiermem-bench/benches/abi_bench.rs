//! C ABI overhead benchmarks: process-engine lookup plus errno plumbing.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tiermem::indicator_abi::{GetMemoryMode, SetCxlMemory, SetHostMemory};
use tiermem::malloc_abi::{cxl_malloc, tiermem_free, tiermem_malloc};

fn bench_abi_malloc_free(c: &mut Criterion) {
    SetHostMemory();
    c.bench_function("abi_malloc_free_256", |b| {
        b.iter(|| unsafe {
            let p = tiermem_malloc(black_box(256));
            tiermem_free(black_box(p));
        });
    });
    c.bench_function("abi_cxl_malloc_free_256", |b| {
        b.iter(|| unsafe {
            let p = cxl_malloc(black_box(256));
            tiermem_free(black_box(p));
        });
    });
}

fn bench_abi_mode_round_trip(c: &mut Criterion) {
    c.bench_function("abi_mode_round_trip", |b| {
        b.iter(|| {
            SetCxlMemory();
            black_box(GetMemoryMode());
            SetHostMemory();
            black_box(GetMemoryMode())
        });
    });
}

fn bench_abi_system_baseline(c: &mut Criterion) {
    c.bench_function("libc_malloc_free_256", |b| {
        b.iter(|| unsafe {
            let p = libc::malloc(black_box(256));
            libc::free(black_box(p));
        });
    });
}

criterion_group!(
    benches,
    bench_abi_malloc_free,
    bench_abi_mode_round_trip,
    bench_abi_system_baseline
);
criterion_main!(benches);
