use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dlr_bridge::mock::MockLoader;
use dlr_bridge::{Bridge, Device, RuntimeId};

fn bench_create_delete(c: &mut Criterion) {
    let bridge = Bridge::new(MockLoader::new());

    c.bench_function("dlr_create_delete", |b| {
        b.iter(|| {
            let h = bridge.create_model(RuntimeId(1), black_box("model"), Device::cpu()).unwrap();
            bridge.delete_model(h).unwrap();
        });
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let bridge = Bridge::new(MockLoader::new());
    let h = bridge.create_model(RuntimeId(1), "model", Device::cpu()).unwrap();

    let mut data = vec![0.0f32; 3 * 224 * 224];
    for (i, v) in data.iter_mut().enumerate() {
        *v = (i % 255) as f32 / 255.0;
    }
    let shape = [1i64, 3, 224, 224];

    c.bench_function("dlr_set_run_get_224x224", |b| {
        b.iter(|| {
            bridge.set_input(h, "data", &shape, black_box(&data), 4).unwrap();
            bridge.run_model(h).unwrap();
            let _ = black_box(bridge.output_shape(h, 0).unwrap());
            let _ = black_box(bridge.output(h, 0).unwrap());
        });
    });
}

fn bench_concurrent_models(c: &mut Criterion) {
    let bridge = std::sync::Arc::new(Bridge::new(MockLoader::new()));
    let handles: Vec<_> = (0..4)
        .map(|_| bridge.create_model(RuntimeId(1), "model", Device::cpu()).unwrap())
        .collect();
    let data = vec![1.0f32; 1024];

    c.bench_function("dlr_concurrent_4threads", |b| {
        b.iter(|| {
            let threads: Vec<_> = handles
                .iter()
                .map(|&h| {
                    let bridge = bridge.clone();
                    let data = data.clone();
                    std::thread::spawn(move || {
                        bridge.set_input(h, "data", &[1, 1024], &data, 2).unwrap();
                        bridge.run_model(h).unwrap();
                        let _ = black_box(bridge.output(h, 0).unwrap());
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_create_delete, bench_round_trip, bench_concurrent_models);
criterion_main!(benches);
