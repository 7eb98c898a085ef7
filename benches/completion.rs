// Copyright 2026 the handoff contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use handoff::{completion, when_all, Outcome, UniqueCompletion};

fn resolve_then_take(c: &mut Criterion) {
    c.bench_function("resolve_then_take", |b| {
        b.iter(|| {
            let (producer, consumer) = completion::<u64, ()>();
            producer.complete_value(1);
            consumer.try_take().unwrap()
        });
    });
}

fn inline_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("inline_chain");
    for depth in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let (producer, mut consumer) = completion::<u64, ()>();
                for _ in 0..depth {
                    consumer = consumer.then(|outcome| outcome.map(|v| v + 1));
                }
                producer.complete_value(0);
                consumer.try_take().unwrap()
            });
        });
    }
    group.finish();
}

fn fan_in(c: &mut Criterion) {
    let mut group = c.benchmark_group("when_all");
    for width in [2usize, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| {
                let sources: Vec<UniqueCompletion<u64, ()>> = (0..width as u64)
                    .map(|v| UniqueCompletion::ready(Outcome::Value(v)))
                    .collect();
                when_all(sources).try_take().unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, resolve_then_take, inline_chain, fan_in);
criterion_main!(benches);
