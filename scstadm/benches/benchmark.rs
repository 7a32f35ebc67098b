use criterion::{black_box, criterion_group, criterion_main, Criterion};

use scstadm::{parse_str, to_conf_string};

fn synthetic_config(targets: usize) -> String {
    let mut text = String::from("setup_id 0x100\nHANDLER vdisk_blockio {\n");
    for i in 0..targets {
        text.push_str(&format!(
            "    DEVICE vol{i} {{ filename /dev/zvol/tank/vol{i}\n        blocksize 4096 }}\n"
        ));
    }
    text.push_str("}\nTARGET_DRIVER iscsi {\n    enabled 1\n");
    for i in 0..targets {
        text.push_str(&format!(
            "    TARGET iqn.2018-11.net.bench:vol{i} {{\n        enabled 1\n        LUN 0 vol{i}\n        GROUP host{i} {{\n            INITIATOR iqn.1993-08.org.debian:host{i}\n            LUN 0 vol{i} read_only=0\n        }}\n    }}\n"
        ));
    }
    text.push_str("}\n");
    text
}

fn bench_parse(c: &mut Criterion) {
    let text = synthetic_config(64);
    c.bench_function("parse 64 targets", |b| {
        b.iter(|| parse_str(black_box(&text), "bench.conf").unwrap())
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let text = synthetic_config(64);
    let cfg = parse_str(&text, "bench.conf").unwrap();
    c.bench_function("serialize 64 targets", |b| {
        b.iter(|| to_conf_string(black_box(&cfg)))
    });
}

criterion_group!(benches, bench_parse, bench_round_trip);
criterion_main!(benches);
