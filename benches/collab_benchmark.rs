use criterion::{criterion_group, criterion_main, Criterion};
use estimate_collab::bus::EventBus;
use estimate_collab::presence::{CursorPosition, PresencePayload, PresenceTracker};
use estimate_collab::protocol::{Envelope, EventType, Frame, PricingUpdate, UserIdentity};
use estimate_collab::rooms::{RoomMember, RoomRegistry};
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn pricing_envelope() -> Envelope {
    PricingUpdate::new(Uuid::new_v4(), "svc-1", "unit_price", 150.0)
        .into_envelope(Uuid::new_v4(), "estimate_1")
        .unwrap()
}

fn bench_envelope_encode(c: &mut Criterion) {
    let envelope = pricing_envelope();

    c.bench_function("envelope_encode_pricing", |b| {
        b.iter(|| {
            black_box(black_box(&envelope).encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let encoded = pricing_envelope().encode().unwrap();

    c.bench_function("envelope_decode_pricing", |b| {
        b.iter(|| {
            black_box(Envelope::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = Frame::Event(pricing_envelope());

    c.bench_function("frame_encode_event", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode().unwrap());
        })
    });
}

fn bench_bus_dispatch_100_subs(c: &mut Criterion) {
    let bus = EventBus::with_defaults();
    for _ in 0..100 {
        bus.subscribe(
            vec![EventType::Pricing],
            Arc::new(|e: &Envelope| {
                black_box(e.timestamp_ms);
            }),
        );
    }

    c.bench_function("bus_dispatch_100_subscriptions", |b| {
        b.iter(|| {
            bus.dispatch_remote(black_box(&pricing_envelope()));
        })
    });
}

fn bench_registry_broadcast_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("registry_broadcast_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = RoomRegistry::with_defaults();

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                    let member = RoomMember {
                        connection_id: Uuid::new_v4(),
                        user: UserIdentity::new(format!("Member{i}"), "estimator"),
                        outbox: tx,
                    };
                    registry.join("estimate_bench", member).await.unwrap();
                    receivers.push(rx);
                }

                let envelope = pricing_envelope().with_room("estimate_bench");
                let count = registry
                    .broadcast("estimate_bench", black_box(&envelope), None)
                    .await
                    .unwrap();
                black_box(count);
            });
        })
    });
}

fn bench_presence_handle_remote_cursor(c: &mut Criterion) {
    let local_id = Uuid::new_v4();
    let remote_id = Uuid::new_v4();

    c.bench_function("presence_handle_remote_cursor", |b| {
        b.iter_custom(|iters| {
            let mut tracker = PresenceTracker::new(local_id);
            let now = Instant::now();
            tracker.handle_remote(
                &PresencePayload::Joined {
                    user: UserIdentity::with_id(remote_id, "Remote", "estimator"),
                },
                now,
            );

            let start = Instant::now();
            for i in 0..iters {
                let cursor = PresencePayload::Cursor {
                    user_id: remote_id,
                    position: CursorPosition::new(i as f32, i as f32 * 0.5),
                    timestamp: i,
                };
                tracker.handle_remote(&cursor, now + Duration::from_millis(i));
            }
            start.elapsed()
        })
    });
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_frame_encode,
    bench_bus_dispatch_100_subs,
    bench_registry_broadcast_100_members,
    bench_presence_handle_remote_cursor,
);
criterion_main!(benches);
