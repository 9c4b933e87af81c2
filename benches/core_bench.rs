//! Benchmarks for gantry core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gantry::core::parser;
use gantry::core::planner::{self, PlanContext};
use gantry::core::resolver::{self, ReferenceResolver};
use gantry::core::state::StateStore;
use gantry::provider::{LocalCloud, ProviderRegistry};
use gantry::secrets::{MemorySource, SealingStore, SecretVault};
use gantry::stack::StaticStackResolver;
use indexmap::IndexMap;
use std::sync::Arc;

/// A stack of `n` routes, each with its own function, integration and
/// permission, behind one API and stage.
fn routes_yaml(n: usize) -> String {
    let mut y = String::from(
        r#"version: "1.0"
name: bench/api
resources:
  - type: http_api
    logicalName: api
    properties: {name: bench-api, protocol_type: HTTP}
  - type: apigw_stage
    logicalName: stage
    properties: {api_id: "{{ref.api.id}}", name: v1, auto_deploy: true}
  - type: iam_role
    logicalName: role
    properties: {assume_role_service: lambda.amazonaws.com}
"#,
    );
    for i in 0..n {
        y.push_str(&format!(
            r#"  - type: lambda_function
    logicalName: fn{i}
    properties:
      role: "{{{{ref.role.arn}}}}"
      runtime: go1.x
      handler: api
      code: fn.zip
  - type: apigw_integration
    logicalName: int{i}
    properties:
      api_id: "{{{{ref.api.id}}}}"
      integration_type: AWS_PROXY
      integration_uri: "{{{{ref.fn{i}.invoke_arn}}}}"
  - type: apigw_route
    logicalName: route{i}
    properties:
      api_id: "{{{{ref.api.id}}}}"
      route_key: "GET /r{i}"
      target: "integrations/{{{{ref.int{i}.id}}}}"
  - type: lambda_permission
    logicalName: perm{i}
    properties:
      action: lambda:InvokeFunction
      function: "{{{{ref.fn{i}.name}}}}"
      principal: apigateway.amazonaws.com
"#
        ));
    }
    y
}

fn bench_blake3_string(c: &mut Criterion) {
    let mut group = c.benchmark_group("blake3_string");
    for size in [64, 1024, 4096] {
        let input: String = "x".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| black_box(gantry::journal::hasher::hash_string(black_box(input))));
        });
    }
    group.finish();
}

fn bench_load_declaration(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_declaration");
    for n in [5, 50] {
        let yaml = routes_yaml(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &yaml, |b, yaml| {
            b.iter(|| black_box(parser::load_declaration(black_box(yaml)).unwrap()));
        });
    }
    group.finish();
}

fn bench_topological_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("topological_order");
    for n in [50, 500] {
        // Layered chain: node i depends on i-1 and i-2.
        let deps: IndexMap<usize, Vec<usize>> = (0..n)
            .map(|i| (i, (i.saturating_sub(2)..i).collect()))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &deps, |b, deps| {
            b.iter(|| black_box(resolver::topological_order(black_box(deps)).unwrap()));
        });
    }
    group.finish();
}

fn bench_plan_empty_state(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fn.zip"), "bootstrap").unwrap();
    let mut graph = parser::load_declaration(&routes_yaml(20)).unwrap();
    graph.base_dir = dir.path().to_path_buf();
    let secrets = SealingStore::new(SecretVault::generate(), MemorySource::default());
    let resolver = ReferenceResolver::new(&graph, Arc::new(StaticStackResolver::default()), Arc::new(secrets));
    let providers = ProviderRegistry::uniform(Arc::new(LocalCloud::new()));
    let state = StateStore::in_memory("bench/api");

    c.bench_function("plan_empty_state_20_routes", |b| {
        b.iter(|| {
            let plan = rt
                .block_on(planner::plan(&PlanContext {
                    graph: &graph,
                    state: &state,
                    providers: &providers,
                    resolver: &resolver,
                    refresh: false,
                }))
                .unwrap();
            black_box(plan)
        });
    });
}

criterion_group!(
    benches,
    bench_blake3_string,
    bench_load_declaration,
    bench_topological_order,
    bench_plan_empty_state,
);
criterion_main!(benches);
