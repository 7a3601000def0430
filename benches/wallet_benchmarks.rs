//! Benchmarks for path expansion, key derivation and coin selection

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hdwallet_rs::coin_selection::select;
use hdwallet_rs::ledger::Utxo;
use hdwallet_rs::network::Network;
use hdwallet_rs::path::{expand, parse_path, template_for, PathContext};
use hdwallet_rs::primitives::address::Address;
use hdwallet_rs::primitives::bip32::HdKey;
use hdwallet_rs::types::{Scheme, ScriptType, WitnessType};

fn context(address_index: u32) -> PathContext {
    PathContext {
        network: Network::Bitcoin,
        purpose: 84,
        account_id: 0,
        witness_type: WitnessType::Segwit,
        cosigner_id: None,
        change: 0,
        address_index,
    }
}

fn bench_path_expansion(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_expansion");
    let (template, _) = template_for(Scheme::Bip32, WitnessType::Segwit, false);

    let partials = [
        ("empty", Vec::new()),
        ("index", parse_path("7").unwrap()),
        ("change_index", parse_path("1/7").unwrap()),
        ("absolute", parse_path("m/84'/0'/3'/0/12").unwrap()),
    ];
    for (name, partial) in partials.iter() {
        group.bench_with_input(BenchmarkId::new("expand", name), partial, |b, partial| {
            b.iter(|| expand(black_box(partial), &template, None, &context(5)).unwrap())
        });
    }

    group.bench_function("parse_path", |b| {
        b.iter(|| parse_path(black_box("m/84h/0h/0h/1/42")).unwrap())
    });

    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");
    let master = HdKey::from_seed(&[0x42u8; 64], Network::Bitcoin).unwrap();

    group.bench_function("derive_hardened", |b| {
        b.iter(|| master.derive_child(black_box(0x8000_0054)).unwrap())
    });
    group.bench_function("derive_normal", |b| {
        b.iter(|| master.derive_child(black_box(7)).unwrap())
    });

    let pubkey = master.public_bytes();
    group.bench_function("p2pkh_address", |b| {
        b.iter(|| Address::p2pkh(black_box(&pubkey), Network::Bitcoin).to_string())
    });
    group.bench_function("p2wpkh_address", |b| {
        b.iter(|| Address::p2wpkh(black_box(&pubkey), Network::Bitcoin).unwrap().to_string())
    });

    group.finish();
}

fn utxo_set(count: usize) -> Vec<Utxo> {
    (0..count)
        .map(|i| Utxo {
            txid: format!("{:064x}", i),
            output_n: 0,
            key_id: i as u64 + 1,
            address: format!("addr{}", i),
            value: 1_000 + (i as u64 * 7_919) % 250_000,
            script: String::new(),
            script_type: ScriptType::P2wpkh,
            confirmations: 6,
            account_id: 0,
            network: Network::Bitcoin,
        })
        .collect()
}

fn bench_coin_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("coin_selection");

    for size in [10usize, 100, 1_000, 10_000].iter() {
        let set = utxo_set(*size);
        let total: u64 = set.iter().map(|u| u.value).sum();

        group.bench_with_input(BenchmarkId::new("single_output", size), &set, |b, set| {
            b.iter(|| select(black_box(set), 50_000, 1_000, None))
        });
        group.bench_with_input(BenchmarkId::new("accumulate", size), &set, |b, set| {
            b.iter(|| select(black_box(set), total / 2, 0, None))
        });
        group.bench_with_input(BenchmarkId::new("accumulate_capped", size), &set, |b, set| {
            b.iter(|| select(black_box(set), total / 2, 0, Some(50)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_path_expansion, bench_key_derivation, bench_coin_selection);
criterion_main!(benches);
