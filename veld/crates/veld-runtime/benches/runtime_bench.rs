//! Runtime micro-benchmarks: value encoding and the allocator fast path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use veld_runtime::{Runtime, RuntimeConfig, ShapeId, Value};

fn bench_value_encoding(c: &mut Criterion) {
    c.bench_function("int_encode_decode", |b| {
        b.iter(|| Value::int(black_box(123_456_789)).unwrap().as_int())
    });

    c.bench_function("float_encode_decode", |b| {
        b.iter(|| Value::float(black_box(3.25)).as_float())
    });

    c.bench_function("small_string_encode", |b| {
        b.iter(|| {
            Value::small_string(black_box("abcdefg"))
                .unwrap()
                .small_byte_length()
        })
    });

    c.bench_function("truthiness", |b| {
        let values = [
            Value::int(0).unwrap(),
            Value::float(1.5),
            Value::NULL,
            Value::TRUE,
        ];
        b.iter(|| values.iter().filter(|v| v.truthiness()).count())
    });
}

fn bench_allocation(c: &mut Criterion) {
    let config = RuntimeConfig {
        worker_count: 2,
        ..Default::default()
    };
    let rt = Runtime::new(config).expect("runtime");
    rt.start();

    c.bench_function("tuple_allocate", |b| {
        b.iter(|| rt.allocate(black_box(ShapeId::Tuple), 3).unwrap())
    });

    rt.shutdown();
}

criterion_group!(benches, bench_value_encoding, bench_allocation);
criterion_main!(benches);
