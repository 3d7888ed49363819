use criterion::{black_box, criterion_group, criterion_main, Criterion};

use seff::ctl::Yielded;
use seff::program::{self, ProgramRef, StreamStep};
use seff::{handler, run, Effect, RunConfig, Value};

fn counter_program(rounds: i64) -> ProgramRef {
    let mut i = 0i64;
    program::from_fn("bench-counter", move |event, _| {
        let value = match event.try_value() {
            Ok(v) => v,
            Err(e) => return StreamStep::Throw(e),
        };
        if i >= rounds {
            return StreamStep::Return(value);
        }
        i += 1;
        if i % 2 == 1 {
            StreamStep::Yield(Yielded::Effect(Effect::put("n", Value::Int(i))))
        } else {
            StreamStep::Yield(Yielded::Effect(Effect::get("n")))
        }
    })
}

fn bench_counter(c: &mut Criterion) {
    c.bench_function("state_counter_1k", |b| {
        b.iter(|| {
            let result = run(
                counter_program(1_000),
                RunConfig::with_handlers(vec![handler::state()]),
            )
            .expect("run succeeds");
            black_box(result.raw_store.len())
        })
    });
}

criterion_group!(benches, bench_counter);
criterion_main!(benches);
