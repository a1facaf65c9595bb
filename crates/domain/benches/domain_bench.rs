use common::{AggregateId, RequestContext};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{Account, Money, Repository, SnapshotPolicy};
use event_store::InMemoryEventStore;

fn open_with_deposits(
    rt: &tokio::runtime::Runtime,
    repo: &Repository<InMemoryEventStore, Account>,
    deposits: usize,
) -> AggregateId {
    let ctx = RequestContext::new();
    let id = AggregateId::new();
    rt.block_on(async {
        repo.execute(&ctx, id, |a| a.open("bench")).await.unwrap();
        for _ in 0..deposits {
            repo.execute(&ctx, id, |a| a.deposit(Money::from_cents(100), None))
                .await
                .unwrap();
        }
    });
    id
}

fn bench_open_account(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("domain/open_account", |b| {
        b.iter(|| {
            rt.block_on(async {
                let repo: Repository<_, Account> = Repository::new(InMemoryEventStore::new());
                repo.execute(&RequestContext::new(), AggregateId::new(), |a| a.open("bench"))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_deposit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let repo: Repository<_, Account> = Repository::new(InMemoryEventStore::new());
    let id = open_with_deposits(&rt, &repo, 0);
    let ctx = RequestContext::new();

    c.bench_function("domain/deposit", |b| {
        b.iter(|| {
            rt.block_on(async {
                repo.execute(&ctx, id, |a| a.deposit(Money::from_cents(1), None))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_load_100_events(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let repo: Repository<_, Account> = Repository::new(InMemoryEventStore::new());
    let id = open_with_deposits(&rt, &repo, 99);

    c.bench_function("domain/load_100_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                repo.load(id).await.unwrap();
            });
        });
    });
}

fn bench_load_100_events_with_snapshot(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let repo: Repository<_, Account> = Repository::new(InMemoryEventStore::new())
        .with_snapshot_policy(SnapshotPolicy::every(50));
    let id = open_with_deposits(&rt, &repo, 99);

    c.bench_function("domain/load_100_events_with_snapshot", |b| {
        b.iter(|| {
            rt.block_on(async {
                repo.load(id).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_open_account,
    bench_deposit,
    bench_load_100_events,
    bench_load_100_events_with_snapshot,
);
criterion_main!(benches);
