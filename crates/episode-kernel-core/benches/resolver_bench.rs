use criterion::{criterion_group, criterion_main, Criterion};
use episode_kernel_core::{
    lexical_score, plan_supersession, resolve_as_of, tokenize_query_terms, CandidateFact,
    EpisodeId, FactId, FactKey, FactRecord, KeySnapshot, ScoredFact,
};
use time::{Duration, OffsetDateTime};

fn mk_fact(index: usize) -> FactRecord {
    let offset = i64::try_from(index).unwrap_or(i64::MAX);
    let valid_from = OffsetDateTime::UNIX_EPOCH + Duration::hours(offset);
    FactRecord {
        fact_id: FactId::new(),
        subject: format!("product_{}", index % 64),
        predicate: "price".to_string(),
        object: format!("${}", 50 + index % 40),
        confidence: 0.9,
        valid_from,
        valid_to: if index % 3 == 0 { None } else { Some(valid_from + Duration::hours(12)) },
        episode_id: EpisodeId::new(),
        created_at: valid_from,
    }
}

fn bench_as_of_resolution(c: &mut Criterion) {
    let records = (0..2_000).map(mk_fact).collect::<Vec<_>>();
    let terms = tokenize_query_terms("product price");
    let scored = records
        .iter()
        .filter_map(|record| {
            lexical_score(&terms, record).map(|score| ScoredFact { record: record.clone(), score })
        })
        .collect::<Vec<_>>();
    let as_of = OffsetDateTime::UNIX_EPOCH + Duration::hours(1_000);

    c.bench_function("resolve_as_of_2000_facts", |b| {
        b.iter(|| {
            let ranked = resolve_as_of(scored.clone(), as_of, 25);
            let _ = std::hint::black_box(ranked);
        });
    });
}

fn bench_supersession_planning(c: &mut Criterion) {
    let timeline = (0..500)
        .map(|index| {
            let mut record = mk_fact(index);
            record.subject = "product_0".to_string();
            let next = OffsetDateTime::UNIX_EPOCH
                + Duration::hours(i64::try_from(index + 1).unwrap_or(i64::MAX));
            record.valid_to = if index == 499 { None } else { Some(next) };
            record
        })
        .collect::<Vec<_>>();
    let key = match FactKey::new("product_0", "price") {
        Ok(key) => key,
        Err(err) => panic!("bench key should validate: {err}"),
    };
    let candidate = CandidateFact {
        key,
        object: "$1".to_string(),
        confidence: 1.0,
        episode_id: EpisodeId::new(),
        reference_time: OffsetDateTime::UNIX_EPOCH + Duration::minutes(250 * 60 + 30),
    };

    c.bench_function("plan_supersession_historical_500", |b| {
        b.iter(|| {
            let snapshot = KeySnapshot::from_timeline(&timeline, candidate.reference_time);
            let plan = plan_supersession(
                &candidate,
                &snapshot,
                FactId::new(),
                OffsetDateTime::UNIX_EPOCH,
            );
            let _ = std::hint::black_box(plan);
        });
    });
}

criterion_group!(benches, bench_as_of_resolution, bench_supersession_planning);
criterion_main!(benches);
