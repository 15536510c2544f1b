use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use guild_core::{ClaimKey, ClaimManager, GuildConfig, GuildId, GuildRegistry, PlayerId};

fn seeded_registry(guilds: u64) -> (GuildRegistry, Vec<GuildId>) {
    let mut registry = GuildRegistry::new(Arc::new(GuildConfig::builtin()), GuildId(1));
    let ids = (0..guilds)
        .filter_map(|n| {
            registry
                .create_guild(&format!("bench{n}"), PlayerId::random(), n)
                .ok()
        })
        .collect();
    (registry, ids)
}

fn bench_claims(c: &mut Criterion) {
    let mut group = c.benchmark_group("claims");

    for guilds in [16u64, 128, 1024] {
        group.bench_with_input(BenchmarkId::new("fill_tier_limit", guilds), &guilds, |b, &guilds| {
            b.iter_batched(
                || {
                    let (registry, ids) = seeded_registry(guilds);
                    (registry, ClaimManager::new(false), ids)
                },
                |(mut registry, mut claims, ids)| {
                    for (row, id) in ids.iter().enumerate() {
                        for x in 0..10 {
                            let key = ClaimKey::new("world", x, row as i32);
                            let _ = claims.try_claim(&mut registry, *id, key, 0);
                        }
                    }
                    claims.len()
                },
                BatchSize::LargeInput,
            )
        });

        group.bench_with_input(BenchmarkId::new("contested", guilds), &guilds, |b, &guilds| {
            b.iter_batched(
                || {
                    let (registry, ids) = seeded_registry(guilds);
                    (registry, ClaimManager::new(false), ids)
                },
                |(mut registry, mut claims, ids)| {
                    // Every guild races for the same strip; only the first wins each chunk.
                    for id in &ids {
                        for x in 0..10 {
                            let _ = claims.try_claim(&mut registry, *id, ClaimKey::new("world", x, 0), 0);
                        }
                    }
                    claims.len()
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_contiguous(c: &mut Criterion) {
    c.bench_function("claims/contiguous_unclaim_line", |b| {
        b.iter_batched(
            || {
                let (mut registry, ids) = seeded_registry(1);
                let id = ids[0];
                let _ = registry.add_exp(id, 40_000);
                let mut claims = ClaimManager::new(true);
                for x in 0..75 {
                    let _ = claims.try_claim(&mut registry, id, ClaimKey::new("world", x, 0), x as u64);
                }
                (registry, claims, id)
            },
            |(mut registry, mut claims, id)| {
                for x in (1..75).rev() {
                    let _ = claims.unclaim(&mut registry, id, &ClaimKey::new("world", x, 0));
                }
                claims.len()
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(claim_benches, bench_claims, bench_contiguous);
criterion_main!(claim_benches);
