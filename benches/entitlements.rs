use std::time::Duration;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tollgate::{
    AccountRecord, AccountStore, CachedEntitlementsManager, Entitlements, EntitlementsManager,
    InMemoryAccountStore, Plan, DEFAULT_TRIAL_DAYS,
};

fn free_record() -> AccountRecord {
    AccountRecord::new("user_free", DEFAULT_TRIAL_DAYS)
}

fn trialing_record() -> AccountRecord {
    let mut record = AccountRecord::new("user_trial", DEFAULT_TRIAL_DAYS);
    let start = Utc::now() - chrono::Duration::days(2);
    record.trial_start_date = Some(start);
    record.trial_end_date = Some(record.trial_end_for(start));
    record.has_used_trial = true;
    record
}

fn premium_record() -> AccountRecord {
    let mut record = AccountRecord::new("user_premium", DEFAULT_TRIAL_DAYS);
    record.plan = Plan::Premium;
    record.subscription_id = Some("sub_1".to_string());
    record
}

// Pure evaluation, the hot path behind every feature gate.
fn benchmark_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    let now = Utc::now();

    for (name, record) in [
        ("free", free_record()),
        ("trialing", trialing_record()),
        ("premium", premium_record()),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| Entitlements::evaluate(black_box(&record), black_box(now)));
        });
    }

    group.finish();
}

// Store-backed reads, with and without the TTL cache in front.
fn benchmark_manager_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("manager_reads");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let store = InMemoryAccountStore::new();
    rt.block_on(store.save_account(&premium_record())).unwrap();

    let direct = EntitlementsManager::new(store.clone());
    let cached =
        CachedEntitlementsManager::new(EntitlementsManager::new(store), Duration::from_secs(60));
    // Warm the cache outside the measurement loop.
    rt.block_on(cached.is_premium("user_premium")).unwrap();

    group.bench_function("store_backed", |b| {
        b.iter(|| {
            rt.block_on(direct.is_premium(black_box("user_premium")))
                .unwrap()
        });
    });

    group.bench_function("cached", |b| {
        b.iter(|| {
            rt.block_on(cached.is_premium(black_box("user_premium")))
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_evaluate, benchmark_manager_reads);
criterion_main!(benches);
