use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use guest_messaging_core::{
    clock::system_clock,
    dlq::MemoryPermanentFailureStore,
    lock_manager::ranges_overlap,
    AcquireRequest, AuditSink, DeadLetterQueue, DistributedLockManager, DlqConfig, FailureInfo,
    GuestMessage, LockAuditEvent, LockConfig, MemoryStore,
};
use rand::{thread_rng, Rng};
use tokio::runtime::Runtime;

struct DiscardAudit;

#[async_trait]
impl AuditSink for DiscardAudit {
    async fn record(&self, _event: LockAuditEvent) {}
}

fn date(offset: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 1).unwrap() + ChronoDuration::days(offset)
}

pub fn overlap_benchmark(c: &mut Criterion) {
    let mut rng = thread_rng();
    let ranges: Vec<(NaiveDate, NaiveDate)> = (0..1024)
        .map(|_| {
            let start = rng.gen_range(0..300);
            (date(start), date(start + rng.gen_range(1..14)))
        })
        .collect();

    c.bench_function("ranges_overlap", |b| {
        b.iter(|| {
            let (a, b2) = ranges[0];
            ranges
                .iter()
                .filter(|(c2, d)| ranges_overlap(black_box(a), black_box(b2), *c2, *d))
                .count()
        })
    });
}

// Acquire + release on a room that already holds `held` non-overlapping locks
pub fn acquire_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("booking_lock_acquire");

    for held in [0usize, 10, 100].iter() {
        let manager = DistributedLockManager::new(
            "bench",
            Arc::new(MemoryStore::new(system_clock())),
            Arc::new(DiscardAudit),
            LockConfig::default(),
        );
        rt.block_on(async {
            for i in 0..*held {
                let offset = 100 + 2 * i as i64;
                manager
                    .acquire(AcquireRequest {
                        room_id: "101",
                        check_in: date(offset),
                        check_out: date(offset + 1),
                        session_id: "seed",
                        user_id: None,
                        ttl: None,
                    })
                    .await
                    .unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(held), held, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let key = manager
                        .acquire(AcquireRequest {
                            room_id: "101",
                            check_in: date(0),
                            check_out: date(3),
                            session_id: "bench",
                            user_id: None,
                            ttl: None,
                        })
                        .await
                        .unwrap();
                    if let Some(key) = key {
                        manager.release(&key).await.unwrap();
                    }
                })
            })
        });
    }
    group.finish();
}

pub fn dlq_enqueue_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dlq = DeadLetterQueue::new(
        Arc::new(MemoryStore::new(system_clock())),
        Arc::new(MemoryPermanentFailureStore::new()),
        DlqConfig::default(),
    );
    let message = GuestMessage {
        message_id: "m1".to_string(),
        tenant_id: "bench".to_string(),
        conversation_id: "conv-1".to_string(),
        channel: "sms".to_string(),
        body: "x".repeat(512),
        received_at: chrono::Utc::now(),
        correlation_id: "corr-1".to_string(),
        metadata: Default::default(),
    };
    let failure = FailureInfo::new("pms_failure", "503");

    c.bench_function("dlq_enqueue", |b| {
        b.iter(|| {
            rt.block_on(dlq.enqueue(black_box(&message), &failure, 0, None))
                .unwrap()
        })
    });
}

criterion_group!(benches, overlap_benchmark, acquire_benchmark, dlq_enqueue_benchmark);
criterion_main!(benches);
