//! Benchmarks for the merge engine hot path: collapsing a discovered set
//! of duplicate profiles into one field map.

use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uniprofile::{FixedClock, FlatFields, MergeEngine, PolicyIndex, Value, FIELD_LOG_PREFIX};

const FIRSTNAMES: [&str; 4] = ["Ann", "Anna", "Anne", "Annika"];
const SEGMENTS: [&str; 5] = ["returning", "newsletter", "trial", "payer", "churn-risk"];

fn stamp(fields: &mut FlatFields, path: &str, at: f64) {
    fields.insert(
        format!("{FIELD_LOG_PREFIX}.{path}"),
        Value::List(vec![Value::Float(at), Value::from("auto")]),
    );
}

/// One duplicate with the field population a real visitor record carries:
/// stamped pii, counters, alias and segment lists, free-form traits.
fn duplicate(rng: &mut StdRng, idx: usize) -> FlatFields {
    let inserted = 1_000.0 + idx as f64 * 60.0;
    let mut fields = FlatFields::new();
    fields.insert("id", format!("p-{idx}"));
    fields.insert("metadata.time.insert", inserted);
    fields.insert("metadata.time.update", inserted + rng.random_range(0.0..600.0));

    fields.insert(
        "ids",
        Value::List(vec![Value::from(format!("ext-{}", rng.random_range(0..32)))]),
    );

    let name = FIRSTNAMES[rng.random_range(0..FIRSTNAMES.len())];
    fields.insert("data.pii.firstname", name);
    stamp(&mut fields, "data.pii.firstname", inserted + rng.random_range(0.0..60.0));
    fields.insert("data.contact.email.main", "kim@example.com");
    stamp(&mut fields, "data.contact.email.main", inserted);
    fields.insert("data.anonymous", rng.random_range(0..4) == 0);
    fields.insert("stats.visits", rng.random_range(1..20) as i64);
    fields.insert("stats.views", rng.random_range(1..200) as i64);

    let segments: Vec<Value> = SEGMENTS
        .iter()
        .filter(|_| rng.random_range(0..2) == 0)
        .map(|s| Value::from(*s))
        .collect();
    fields.insert("segments", Value::List(segments));

    for t in 0..rng.random_range(2..6) {
        let path = format!("traits.t{t}");
        fields.insert(path.clone(), format!("v-{}", rng.random_range(0..8)));
        stamp(&mut fields, &path, inserted + t as f64);
    }
    fields
}

fn duplicates(count: usize) -> Vec<FlatFields> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count).map(|i| duplicate(&mut rng, i)).collect()
}

fn bench_collapse(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_collapse");
    group.warm_up_time(Duration::from_millis(500));

    let clock = FixedClock::new(1_000_000.0);
    let policies = PolicyIndex::profile_defaults();

    for &count in &[2usize, 8, 32, 128] {
        let set = duplicates(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("duplicates", count), &set, |b, set| {
            let engine = MergeEngine::new(&policies, &clock);
            b.iter(|| black_box(engine.merge(black_box(set)).unwrap()));
        });
    }
    group.finish();
}

fn bench_flatten(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_flattening");

    let json: serde_json::Value = serde_json::from_str(
        r#"{
            "data": {
                "pii": { "firstname": "Ann", "lastname": "Lee" },
                "contact": {
                    "email": { "main": "kim@example.com", "business": "kim@corp.example" },
                    "phone": { "main": "+48 600 000 000" }
                }
            },
            "traits": { "plan": "pro", "referrer": "ads", "theme": "dark" },
            "stats": { "visits": 17, "views": 120 }
        }"#,
    )
    .unwrap();
    let nested = Value::from(json);

    group.bench_function("from_nested", |b| {
        b.iter(|| black_box(FlatFields::from_nested(black_box(&nested))));
    });

    let flat = FlatFields::from_nested(&nested);
    group.bench_function("to_nested", |b| {
        b.iter(|| black_box(black_box(&flat).to_nested()));
    });
    group.finish();
}

criterion_group!(benches, bench_collapse, bench_flatten);
criterion_main!(benches);
