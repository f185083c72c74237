use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use bson::{doc, oid::ObjectId, Document};
use ruta::selection::{self, read_preference::parse_tag_set};
use ruta::{NodeDescription, ReadPreference, SelectionCriteria, ServerAddress, TopologyDescription};

fn hosts(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("rs-{}:27017", i)).collect()
}

fn member_hello(index: usize, hosts: &[String]) -> Document {
    let dc = if index % 2 == 0 { "east" } else { "west" };
    let mut reply = doc! {
        "ok": 1,
        "setName": "rs0",
        "hosts": hosts.to_vec(),
        "minWireVersion": 0,
        "maxWireVersion": 21,
        "tags": { "dc": dc, "rack": (index % 4).to_string() },
        "lastWrite": { "lastWriteDate": 1_700_000_000_000_i64 - (index as i64) * 100 },
    };
    if index == 0 {
        reply.insert("isWritablePrimary", true);
        reply.insert("setVersion", 1_i64);
        reply.insert("electionId", ObjectId::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]));
    } else {
        reply.insert("secondary", true);
    }
    reply
}

/// A fully discovered replica set with `count` members
fn replica_set(count: usize) -> TopologyDescription {
    let hosts = hosts(count);
    let seeds = hosts.iter().map(|h| ServerAddress::parse(h).unwrap()).collect();
    let mut topology = TopologyDescription::new(
        seeds,
        Some("rs0".to_string()),
        false,
        Duration::from_secs(10),
        Duration::from_millis(15),
    );
    for (index, host) in hosts.iter().enumerate() {
        let rtt = Duration::from_millis(1 + (index as u64 % 7) * 4);
        let description = NodeDescription::from_hello(
            ServerAddress::parse(host).unwrap(),
            &member_hello(index, &hosts),
            Some(rtt),
        )
        .unwrap();
        topology.update(description);
    }
    topology
}

fn bench_read_preferences(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_server");

    for count in [3usize, 7, 50] {
        let topology = replica_set(count);
        let cases = [
            ("primary", SelectionCriteria::Write),
            ("nearest", ReadPreference::nearest().into()),
            (
                "secondary_tags",
                ReadPreference::secondary()
                    .with_tag_sets(vec![
                        parse_tag_set("dc:north").unwrap(),
                        parse_tag_set("dc:west,rack:3").unwrap(),
                    ])
                    .into(),
            ),
            (
                "secondary_staleness",
                ReadPreference::secondary()
                    .with_max_staleness(Duration::from_secs(90))
                    .into(),
            ),
        ];

        for (name, criteria) in cases.iter() {
            group.bench_with_input(BenchmarkId::new(*name, count), &topology, |b, topology| {
                b.iter(|| {
                    let selected = selection::select_server(topology, criteria, &[]).unwrap();
                    black_box(selected);
                });
            });
        }
    }

    group.finish();
}

fn bench_latency_window(c: &mut Criterion) {
    let topology = replica_set(50);
    let criteria: SelectionCriteria = ReadPreference::nearest().into();

    c.bench_function("suitable_servers_50", |b| {
        b.iter(|| {
            let candidates = selection::suitable_servers(&topology, &criteria).unwrap();
            black_box(candidates.len());
        });
    });
}

criterion_group!(benches, bench_read_preferences, bench_latency_window);
criterion_main!(benches);
