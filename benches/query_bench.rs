use admitdesk::cache::cache_key;
use admitdesk::db::{self, Collection};
use admitdesk::export::{to_csv, LEAD_COLUMNS};
use admitdesk::messaging::render;
use admitdesk::query::sql::select_documents;
use admitdesk::query::{Filter, Pipeline, SortKey};
use admitdesk::segments::{build_filter, DateRange, SegmentCriteria, SegmentModule};
use admitdesk::store::DocumentStore;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::runtime::Runtime;

fn sample_lead(i: usize) -> Value {
    json!({
        "name": format!("Student {}", i),
        "email": format!("student{}@mail.test", i),
        "mobile": format!("98765{:05}", i),
        "college_id": "college-north",
        "state_code": ["MH", "KA", "DL", "TN"][i % 4],
        "city": ["Pune", "Bengaluru", "Delhi", "Chennai"][i % 4],
        "course_name": if i % 3 == 0 { "MBA" } else { "B.Tech" },
        "lead_stage": ["fresh", "follow_up", "interested"][i % 3],
        "fee": (i % 10) as f64 * 100.0,
    })
}

fn sample_criteria() -> SegmentCriteria {
    SegmentCriteria {
        state_codes: Some(vec!["MH".to_string(), "KA".to_string()]),
        cities: Some(vec!["Pune".to_string()]),
        course_names: Some(vec!["B.Tech".to_string()]),
        lead_stages: Some(vec!["fresh".to_string(), "interested".to_string()]),
        date_range: Some(DateRange { start: Some("2024-01-01".to_string()), end: Some("2024-12-31".to_string()) }),
        ..Default::default()
    }
}

fn benchmark_filter_compile(c: &mut Criterion) {
    let criteria = sample_criteria();

    c.bench_function("segment_build_filter", |b| {
        b.iter(|| black_box(build_filter(SegmentModule::Lead, black_box(&criteria)).unwrap()))
    });

    let filter = build_filter(SegmentModule::Lead, &criteria)
        .unwrap()
        .and(Filter::eq("college_id", "college-north"))
        .and(Filter::search(&["name", "email", "mobile"], "student 4"));
    let pipeline = Pipeline::new(Collection::Students)
        .matching(filter)
        .sort(vec![SortKey::desc("created_at"), SortKey::asc("name")])
        .skip(50)
        .limit(25);

    c.bench_function("pipeline_plan_and_sql", |b| {
        b.iter(|| {
            let plan = black_box(&pipeline).plan().unwrap();
            let qb = select_documents(&plan).unwrap();
            black_box(qb.sql().len())
        })
    });
}

fn benchmark_render_and_csv(c: &mut Criterion) {
    let template = "Dear {{ name }}, your application for {{ course_name }} in {{city}} is {{ lead_stage }}. \
                    Fee due: {{ fee }}. Contact {{ counselor.name }} for help.";
    let context = sample_lead(7);

    c.bench_function("template_render", |b| b.iter(|| black_box(render(black_box(template), &context))));

    let mut group = c.benchmark_group("csv_export");
    for rows in [100usize, 1_000, 5_000].iter() {
        let docs: Vec<Value> = (0..*rows).map(sample_lead).collect();
        group.bench_with_input(BenchmarkId::from_parameter(rows), &docs, |b, docs| {
            b.iter(|| black_box(to_csv(&LEAD_COLUMNS, docs).len()))
        });
    }
    group.finish();

    let params = json!({ "page_num": 3, "page_size": 25, "state_code": "MH", "sort": "-created_at" });
    c.bench_function("cache_key", |b| {
        b.iter(|| black_box(cache_key("students", "college-north", black_box(&params)).unwrap()))
    });
}

fn benchmark_store_queries(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = rt.block_on(async {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::init_db(&pool).await.unwrap();
        let store = DocumentStore::new(pool);
        for i in 0..2_000 {
            store.insert(Collection::Students, sample_lead(i)).await.unwrap();
        }
        store
    });

    let mut group = c.benchmark_group("store");

    let page = Pipeline::new(Collection::Students)
        .matching(Filter::eq("college_id", "college-north").and(Filter::eq("state_code", "MH")))
        .sort(vec![SortKey::desc("fee")])
        .limit(25);
    group.bench_function("find_with_total", |b| {
        b.iter(|| rt.block_on(async { black_box(store.find_with_total(&page).await.unwrap().1) }))
    });

    let funnel = Pipeline::new(Collection::Students)
        .matching(Filter::eq("college_id", "college-north"))
        .group_by("lead_stage", Some("fee"));
    group.bench_function("aggregate_by_stage", |b| {
        b.iter(|| rt.block_on(async { black_box(store.aggregate(&funnel).await.unwrap().len()) }))
    });

    let segment = build_filter(SegmentModule::Lead, &SegmentCriteria { date_range: None, ..sample_criteria() }).unwrap();
    group.bench_function("segment_count", |b| {
        b.iter(|| rt.block_on(async { black_box(store.count(Collection::Students, segment.clone()).await.unwrap()) }))
    });

    group.finish();
}

criterion_group!(benches, benchmark_filter_compile, benchmark_render_and_csv, benchmark_store_queries);
criterion_main!(benches);
