//! Manifest and dispatch benchmarks
//!
//! Run with: cargo bench --bench manifest_parse

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;

use serde_json::json;
use skillgate::dispatch::{select_binding, ConversationContext};
use skillgate::manifest::{parse_manifest, validate_manifest, RiskLevel};
use skillgate::policy::{evaluate, BindingPolicy};
use skillgate::store::{NewBinding, NewSkill, ScopeKind, SkillStore, SourceKind};

const MANIFEST: &str = r#"{
    "id": "weather",
    "name": "Weather",
    "version": "1.2.0",
    "entry": "main.py",
    "description": "Current conditions and forecasts",
    "tools": [
        {"name": "weather_now", "description": "Current conditions",
         "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}},
         "aliases": ["now"]},
        {"name": "weather_forecast", "description": "Five day forecast",
         "input_schema": {"type": "object", "properties": {"city": {"type": "string"}}}}
    ],
    "dependencies": ["requests>=2.31"],
    "runtime": {"type": "python", "timeout_secs": 30},
    "permissions": ["network"],
    "risk_level": "medium"
}"#;

fn benchmark_manifest(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest");
    group.throughput(Throughput::Bytes(MANIFEST.len() as u64));

    group.bench_function("parse_manifest", |b| {
        b.iter(|| parse_manifest(black_box(MANIFEST), "skill.json").unwrap());
    });

    let manifest = parse_manifest(MANIFEST, "skill.json").unwrap();
    group.bench_function("validate_manifest", |b| {
        b.iter(|| validate_manifest(black_box(&manifest)).unwrap());
    });

    group.finish();
}

fn benchmark_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy");
    let policy = BindingPolicy::from_value(&json!({
        "decision": "require_approval",
        "tools": {"weather_now": "allow"}
    }));

    group.bench_function("evaluate_with_override", |b| {
        b.iter(|| {
            evaluate(
                black_box(Some(RiskLevel::Medium)),
                policy.decision_for(black_box("Weather_Now")),
                false,
            )
        });
    });

    group.finish();
}

fn benchmark_binding_selection(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = Arc::new(SkillStore::in_memory());

    let bindings = rt.block_on(async {
        let skill = store
            .upsert_skill(NewSkill {
                slug: "weather".into(),
                display_name: "Weather".into(),
                description: String::new(),
                source_kind: SourceKind::RemoteRepository,
                source_locator: None,
            })
            .await
            .unwrap();
        for (scope, id) in [
            (ScopeKind::System, None),
            (ScopeKind::User, Some("alice")),
            (ScopeKind::Session, Some("s1")),
            (ScopeKind::BattleRun, Some("b1")),
        ] {
            store
                .upsert_binding(NewBinding {
                    skill_id: skill.id,
                    version_id: None,
                    scope,
                    scope_id: id.map(String::from),
                    enabled: true,
                    policy: serde_json::Value::Null,
                })
                .await
                .unwrap();
        }
        store.bindings_for(skill.id).await
    });

    let context = ConversationContext {
        session_id: Some("s1".into()),
        user_id: Some("alice".into()),
        battle_run_id: None,
        message_id: None,
    };

    c.bench_function("select_binding", |b| {
        b.iter(|| select_binding(black_box(&bindings), black_box(&context)));
    });
}

criterion_group!(
    benches,
    benchmark_manifest,
    benchmark_policy,
    benchmark_binding_selection
);
criterion_main!(benches);
