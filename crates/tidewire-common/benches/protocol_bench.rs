// Criterion benchmarks for tidewire-common
//
// Run benchmarks with:
//   cargo bench -p tidewire-common

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tidewire_common::{
    Codec, ObjectRef, RequestId, RpcRequest, RpcResponse, RpcStats, RpcValue, Serializer,
};

fn wide_object(n: usize) -> RpcValue {
    let obj = ObjectRef::new();
    for i in 0..n {
        obj.set(format!("field_{i}"), RpcValue::from(i as i64));
    }
    RpcValue::Object(obj)
}

fn bench_serializer(c: &mut Criterion) {
    let mut group = c.benchmark_group("serializer");
    let serializer = Serializer::new();

    group.bench_function("flat_object_32", |b| {
        let value = wide_object(32);
        b.iter(|| serializer.prepare(black_box(&value)));
    });

    group.bench_function("nested_arrays_depth_64", |b| {
        let mut value = RpcValue::from("leaf");
        for _ in 0..64 {
            value = RpcValue::array(vec![value, RpcValue::from(1)]);
        }
        b.iter(|| serializer.prepare(black_box(&value)));
    });

    group.bench_function("self_referencing_object", |b| {
        let obj = ObjectRef::new();
        obj.set("a", RpcValue::from(1));
        obj.set("self", RpcValue::Object(obj.clone()));
        let value = RpcValue::Object(obj);
        b.iter(|| serializer.prepare(black_box(&value)));
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let args = Serializer::new().prepare(&wide_object(8));
    let batch: Vec<RpcRequest> = (0..10)
        .map(|i| RpcRequest::new(i as i64, "echo", args.clone()))
        .collect();
    let responses: Vec<RpcResponse> = (0..10)
        .map(|i| RpcResponse::success(RequestId::from(i as i64), args.clone(), RpcStats::new(90, 30)))
        .collect();

    for codec in [Codec::Json, Codec::MessagePack] {
        let encoded = codec.encode_batch_request(&batch).unwrap();
        group.bench_function(format!("decode_batch_{codec:?}"), |b| {
            b.iter(|| codec.decode_frame(black_box(&encoded)))
        });
        group.bench_function(format!("encode_batch_{codec:?}"), |b| {
            b.iter(|| codec.encode_batch(black_box(&responses)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_serializer, bench_codec);
criterion_main!(benches);
