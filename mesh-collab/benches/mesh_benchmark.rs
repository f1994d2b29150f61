use criterion::{criterion_group, criterion_main, Criterion};
use mesh_collab::awareness::{Awareness, Origin};
use mesh_collab::broadcast::{BroadcastGuard, BroadcastHub};
use mesh_collab::codec::{Any, Decoder, Encoder};
use mesh_collab::crypto::EncryptionKey;
use mesh_collab::protocol::Message;
use mesh_collab::sync::{Document, YrsDocument};
use std::collections::HashMap;
use std::hint::black_box;

fn sample_state() -> Any {
    let mut map = HashMap::new();
    map.insert("name".to_string(), Any::from("alice"));
    map.insert("cursor".to_string(), Any::from(1234.0));
    map.insert("online".to_string(), Any::Bool(true));
    Any::object(map)
}

fn bench_var_uint_roundtrip(c: &mut Criterion) {
    c.bench_function("var_uint_roundtrip_1000", |b| {
        b.iter(|| {
            let mut encoder = Encoder::with_capacity(4096);
            for n in 0..1000u64 {
                encoder.write_var_uint(black_box(n * 7919));
            }
            let bytes = encoder.into_bytes();
            let mut decoder = Decoder::new(&bytes);
            for _ in 0..1000 {
                black_box(decoder.read_var_uint().unwrap());
            }
        })
    });
}

fn bench_any_encode(c: &mut Criterion) {
    let state = sample_state();
    c.bench_function("any_encode_object", |b| {
        b.iter(|| {
            let mut encoder = Encoder::new();
            encoder.write_any(black_box(&state));
            black_box(encoder.into_bytes());
        })
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let encoded = Message::update(vec![0u8; 64]).encode();
    c.bench_function("message_decode_update_64B", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_encode_100(c: &mut Criterion) {
    let awareness = Awareness::new(0);
    let mut update = Encoder::new();
    update.write_var_uint(100);
    for id in 1..=100u64 {
        update.write_var_uint(id);
        update.write_var_uint(0);
        update.write_var_string(&sample_state().to_json_string());
    }
    awareness.apply_update(update.as_bytes(), Origin::Remote("bench".into())).unwrap();

    c.bench_function("awareness_encode_full_100", |b| {
        b.iter(|| {
            black_box(awareness.encode_full_update());
        })
    });
}

fn bench_awareness_apply_100(c: &mut Criterion) {
    let mut update = Encoder::new();
    update.write_var_uint(100);
    for id in 1..=100u64 {
        update.write_var_uint(id);
        update.write_var_uint(1);
        update.write_var_string(&sample_state().to_json_string());
    }
    let bytes = update.into_bytes();

    c.bench_function("awareness_apply_100", |b| {
        b.iter(|| {
            let target = Awareness::new(0);
            target.apply_update(black_box(&bytes), Origin::Remote("bench".into())).unwrap();
            black_box(target.client_ids().len());
        })
    });
}

fn bench_sync_handshake(c: &mut Criterion) {
    let source = YrsDocument::new().unwrap();
    for i in 0..100 {
        source.insert_text("t", i, "x");
    }

    c.bench_function("sync_update_reply_100_ops", |b| {
        b.iter(|| {
            let target = YrsDocument::new().unwrap();
            let update = source.encode_state_as_update(&target.encode_state_vector()).unwrap();
            target.apply_update(&update, "bench").unwrap();
            black_box(target.text("t").len());
        })
    });
}

fn bench_encrypt_1kb(c: &mut Criterion) {
    let key = EncryptionKey::from_bytes(&[7u8; 32]);
    let payload = vec![0u8; 1024];
    c.bench_function("aes_gcm_encrypt_1KB", |b| {
        b.iter(|| {
            black_box(key.encrypt(black_box(&payload)).unwrap());
        })
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let hub = BroadcastHub::new(2048);
    let (sender, _own) = hub.join("bench");
    let mut receivers: Vec<_> = (0..10).map(|_| hub.join("bench").1).collect();

    c.bench_function("broadcast_100_msgs_10_members", |b| {
        b.iter(|| {
            for _ in 0..100 {
                sender.publish(vec![0u8; 64]);
            }
            for receiver in &mut receivers {
                while let Some(frame) = receiver.try_recv() {
                    black_box(frame);
                }
            }
        })
    });
}

fn bench_guard_uncontended(c: &mut Criterion) {
    let guard = BroadcastGuard::new();
    c.bench_function("broadcast_guard_run", |b| {
        b.iter(|| {
            black_box(guard.run(|| {}));
        })
    });
}

criterion_group!(
    benches,
    bench_var_uint_roundtrip,
    bench_any_encode,
    bench_message_decode,
    bench_awareness_encode_100,
    bench_awareness_apply_100,
    bench_sync_handshake,
    bench_encrypt_1kb,
    bench_broadcast_fanout,
    bench_guard_uncontended,
);
criterion_main!(benches);
