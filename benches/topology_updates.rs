use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use bson::{doc, oid::ObjectId, Document};
use ruta::{NodeDescription, ServerAddress, TopologyDescription};

fn election_id(n: u8) -> ObjectId {
    let mut bytes = [0u8; 12];
    bytes[11] = n;
    ObjectId::from_bytes(bytes)
}

fn hello(primary: bool, hosts: &[String], set_version: i64, term: u8) -> Document {
    let mut reply = doc! {
        "ok": 1,
        "setName": "rs0",
        "hosts": hosts.to_vec(),
        "minWireVersion": 0,
        "maxWireVersion": 21,
    };
    if primary {
        reply.insert("isWritablePrimary", true);
        reply.insert("setVersion", set_version);
        reply.insert("electionId", election_id(term));
    } else {
        reply.insert("secondary", true);
    }
    reply
}

fn seeds(hosts: &[String]) -> Vec<ServerAddress> {
    hosts.iter().map(|h| ServerAddress::parse(h).unwrap()).collect()
}

/// Heartbeat replies for a steady set, then a sequence of elections where
/// primaryship rotates through the members
fn replies(hosts: &[String], elections: usize) -> Vec<NodeDescription> {
    let mut replies = Vec::new();
    for (index, host) in hosts.iter().enumerate() {
        replies.push((host.clone(), hello(index == 0, hosts, 1, 1)));
    }
    for term in 0..elections {
        let winner = (term + 1) % hosts.len();
        let loser = term % hosts.len();
        replies.push((hosts[winner].clone(), hello(true, hosts, 1, term as u8 + 2)));
        replies.push((hosts[loser].clone(), hello(false, hosts, 1, 0)));
    }

    replies
        .into_iter()
        .map(|(host, reply)| {
            NodeDescription::from_hello(
                ServerAddress::parse(&host).unwrap(),
                &reply,
                Some(Duration::from_millis(2)),
            )
            .unwrap()
        })
        .collect()
}

fn bench_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("topology_update");

    for count in [3usize, 7, 50] {
        let hosts: Vec<String> = (0..count).map(|i| format!("rs-{}:27017", i)).collect();
        let replies = replies(&hosts, 20);
        let initial = TopologyDescription::new(
            seeds(&hosts),
            Some("rs0".to_string()),
            false,
            Duration::from_secs(10),
            Duration::from_millis(15),
        );

        group.bench_with_input(BenchmarkId::new("elections", count), &replies, |b, replies| {
            b.iter(|| {
                let mut topology = initial.clone();
                for reply in replies {
                    topology.update(reply.clone());
                }
                black_box(topology.version());
            });
        });

        // a steady heartbeat that changes nothing
        let mut steady = initial.clone();
        for reply in &replies[..count] {
            steady.update(reply.clone());
        }
        let heartbeat = replies[1].clone();
        group.bench_function(BenchmarkId::new("unchanged_heartbeat", count), |b| {
            b.iter(|| black_box(steady.update(heartbeat.clone())));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_updates);
criterion_main!(benches);
