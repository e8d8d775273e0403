use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::hint::black_box;
use impactflow_realtime::broadcast::{Broadcaster, ChannelReceiver, ClientChannel};
use impactflow_realtime::protocol::{ClientIntent, CursorPosition, ServerEvent, User, UserRole};
use impactflow_realtime::registry::RoomRegistry;
use serde_json::json;

fn member(i: usize) -> User {
    User::new(format!("U{i:03}"), format!("User {i}"), format!("u{i}@example.com"), UserRole::TeamMember)
}

fn room_of(size: usize) -> (Broadcaster, Vec<ChannelReceiver>) {
    let mut broadcaster = Broadcaster::new();
    let mut receivers = Vec::with_capacity(size);
    for _ in 0..size {
        let (channel, rx) = ClientChannel::new(32);
        broadcaster.subscribe(channel, "P1");
        receivers.push(rx);
    }
    (broadcaster, receivers)
}

fn drain(receivers: &mut [ChannelReceiver]) {
    for rx in receivers.iter_mut() {
        while rx.try_recv().is_some() {}
    }
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let (mut broadcaster, mut receivers) = room_of(100);
    let event = ServerEvent::TaskUpdated {
        task_id: "T1".into(),
        changes: json!({"percentComplete": 60, "status": "In Progress"}),
    };

    c.bench_function("broadcast_task_update_100_channels", |b| {
        b.iter(|| {
            black_box(broadcaster.broadcast(black_box("P1"), &event, None));
            drain(&mut receivers);
        })
    });
}

fn bench_volatile_fan_out(c: &mut Criterion) {
    let (mut broadcaster, mut receivers) = room_of(100);
    let event = ServerEvent::CursorMove {
        position: CursorPosition::new(320.0, 128.5),
        user_id: "U000".into(),
    };

    c.bench_function("broadcast_cursor_100_channels", |b| {
        b.iter(|| {
            black_box(broadcaster.broadcast_volatile(black_box("P1"), &event, None));
            drain(&mut receivers);
        })
    });
}

fn bench_volatile_full_lanes(c: &mut Criterion) {
    // Receivers never drained: every lane is full after 32 events.
    let (mut broadcaster, _receivers) = room_of(100);
    let event = ServerEvent::CursorMove {
        position: CursorPosition::new(1.0, 2.0),
        user_id: "U000".into(),
    };
    for _ in 0..32 {
        broadcaster.broadcast_volatile("P1", &event, None);
    }

    c.bench_function("broadcast_cursor_dropped_100_channels", |b| {
        b.iter(|| black_box(broadcaster.broadcast_volatile("P1", &event, None)))
    });
}

fn bench_purge_user(c: &mut Criterion) {
    c.bench_function("purge_user_1000_editing_tasks", |b| {
        b.iter_batched(
            || {
                let mut registry = RoomRegistry::new();
                for i in 0..50 {
                    registry.join("P1", member(i));
                }
                for t in 0..1000 {
                    registry.start_editing(&format!("T{t}"), &format!("U{:03}", t % 50));
                }
                registry
            },
            |mut registry| black_box(registry.purge_user("P1", "U007")),
            BatchSize::SmallInput,
        )
    });
}

fn bench_users_online_encode(c: &mut Criterion) {
    let event = ServerEvent::UsersOnline {
        users: (0..50).map(member).collect(),
    };

    c.bench_function("users_online_encode_50", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_intent_decode(c: &mut Criterion) {
    let text = ClientIntent::CursorMove {
        position: CursorPosition::new(10.0, 20.0),
        user_id: "U001".into(),
    }
    .encode()
    .unwrap();

    c.bench_function("cursor_intent_decode", |b| {
        b.iter(|| black_box(ClientIntent::decode(black_box(&text)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_broadcast_fan_out,
    bench_volatile_fan_out,
    bench_volatile_full_lanes,
    bench_purge_user,
    bench_users_online_encode,
    bench_intent_decode,
);
criterion_main!(benches);
