//! Integration test: determinism and book invariants under a random stream
//!
//! The same command stream must produce the same deals per target no matter
//! how many shards the engine runs, and no stream may leave a book crossed
//! or an order over-filled.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dealbook_engine::*;
use dealbook_matchcore::compute_deal_root;
use dealbook_types::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TARGETS: [&str; 4] = ["AAPL", "MSFT", "TSLA", "BTC-KRW"];

#[derive(Clone)]
struct Placed {
    user: String,
    side: Side,
    target: &'static str,
}

/// A reproducible mix of places, cancels and updates.
fn random_stream(seed: u64, len: usize) -> (Vec<Command>, HashMap<RequestId, Amount>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut placed: Vec<(String, Placed)> = Vec::new();
    let mut amounts = HashMap::new();
    let mut commands = Vec::with_capacity(len);
    let start = DateTime::<Utc>::UNIX_EPOCH;

    for i in 0..len {
        let request_id = format!("req-{i}");
        let issued_at = start + TimeDelta::milliseconds(i64::try_from(i).unwrap());
        let roll: u8 = rng.gen_range(0..10);

        let command = if placed.is_empty() || roll < 6 {
            let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
            let user = format!("user-{}", rng.gen_range(0..5));
            let target = TARGETS[rng.gen_range(0..TARGETS.len())];
            let amount = rng.gen_range(1..=10);
            let price = rng.gen_range(95..=105);
            amounts.insert(RequestId::new(request_id.as_str()), amount);
            placed.push((request_id.clone(), Placed { user: user.clone(), side, target }));
            Command::place(side, request_id, user, target, amount, price)
        } else if roll < 8 {
            let (original, p) = placed[rng.gen_range(0..placed.len())].clone();
            Command::cancel(request_id, p.user, original)
        } else {
            let (original, p) = placed[rng.gen_range(0..placed.len())].clone();
            let amount = rng.gen_range(1..=10);
            let price = rng.gen_range(95..=105);
            amounts.insert(RequestId::new(request_id.as_str()), amount);
            placed.push((request_id.clone(), p.clone()));
            Command::update(p.side, request_id, p.user, original, p.target, amount, price)
        };
        commands.push(command.with_issued_at(issued_at));
    }
    (commands, amounts)
}

async fn run(shards: u32, commands: &[Command]) -> (Engine, Vec<Receipt>) {
    let config = EngineConfig {
        shard_count: shards,
        snapshot_every: 0,
        ..EngineConfig::default()
    };
    let (sink, mut deals) = ChannelSink::channel(16);
    // Drain the sink so shards never block on it.
    tokio::spawn(async move { while deals.recv().await.is_some() {} });

    let mut engine = Engine::start(
        config,
        Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(300))),
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(sink),
    )
    .await
    .unwrap();

    let mut receipts = Vec::with_capacity(commands.len());
    for command in commands {
        receipts.push(engine.submit(command.clone()).await.unwrap());
    }
    (engine, receipts)
}

fn deals_by_target(receipts: &[Receipt]) -> BTreeMap<Target, Vec<Deal>> {
    let mut by_target: BTreeMap<Target, Vec<Deal>> = BTreeMap::new();
    for receipt in receipts {
        for deal in receipt.deals() {
            by_target.entry(deal.target.clone()).or_default().push(deal.clone());
        }
    }
    by_target
}

#[tokio::test]
async fn same_stream_same_deals_for_any_shard_count() {
    let (commands, _) = random_stream(42, 600);

    let (one, receipts_one) = run(1, &commands).await;
    let (four, receipts_four) = run(4, &commands).await;

    let a = deals_by_target(&receipts_one);
    let b = deals_by_target(&receipts_four);
    assert!(!a.is_empty(), "the stream should trade");
    assert_eq!(a.keys().collect::<Vec<_>>(), b.keys().collect::<Vec<_>>());
    for (target, deals) in &a {
        assert_eq!(
            compute_deal_root(deals),
            compute_deal_root(&b[target]),
            "deal stream for {target} differs between 1 and 4 shards"
        );
    }

    for symbol in TARGETS {
        let target = Target::new(symbol);
        assert_eq!(
            one.book_view(&target, 100).await.unwrap(),
            four.book_view(&target, 100).await.unwrap()
        );
    }
    one.shutdown().await.unwrap();
    four.shutdown().await.unwrap();
}

#[tokio::test]
async fn random_stream_keeps_book_invariants() {
    for seed in [1, 7, 1234] {
        let (commands, amounts) = random_stream(seed, 400);
        let (engine, receipts) = run(3, &commands).await;

        for symbol in TARGETS {
            let Some(depth) = engine.book_view(&Target::new(symbol), 1000).await.unwrap() else {
                continue;
            };
            if let (Some(bid), Some(ask)) = (depth.bids.first(), depth.asks.first()) {
                assert!(bid.price < ask.price, "{symbol} crossed at rest (seed {seed})");
            }
            assert!(depth.bids.windows(2).all(|w| w[0].price > w[1].price));
            assert!(depth.asks.windows(2).all(|w| w[0].price < w[1].price));
            assert!(depth.bids.iter().chain(&depth.asks).all(|l| l.amount > 0));
        }

        let mut filled: HashMap<RequestId, Amount> = HashMap::new();
        for receipt in &receipts {
            for deal in receipt.deals() {
                assert!(deal.amount > 0);
                *filled.entry(deal.buy_order_id.clone()).or_default() += deal.amount;
                *filled.entry(deal.sell_order_id.clone()).or_default() += deal.amount;

                let maker = receipt_order_price(&receipts, deal.maker_order_id());
                assert_eq!(Some(deal.price), maker, "deal executes at the maker's price");
            }
        }
        for (id, amount) in &filled {
            assert!(amount <= &amounts[id], "order {id} over-filled (seed {seed})");
        }
        engine.shutdown().await.unwrap();
    }
}

/// Limit price the order `id` was placed with.
fn receipt_order_price(receipts: &[Receipt], id: &RequestId) -> Option<Price> {
    receipts.iter().find_map(|r| match &r.outcome {
        Outcome::Placed { order, .. } | Outcome::Replaced { order, .. } if &order.id == id => {
            Some(order.price)
        }
        _ => None,
    })
}

#[tokio::test]
async fn redelivering_the_whole_stream_changes_nothing() {
    let (commands, _) = random_stream(99, 300);
    let (mut engine, first) = run(2, &commands).await;

    let before: Vec<_> = {
        let mut views = Vec::new();
        for symbol in TARGETS {
            views.push(engine.book_view(&Target::new(symbol), 100).await.unwrap());
        }
        views
    };

    for (command, original) in commands.iter().zip(&first) {
        let again = engine.submit(command.clone()).await.unwrap();
        assert!(again.replayed);
        assert_eq!(again.outcome, original.outcome);
    }

    for (symbol, view) in TARGETS.iter().zip(before) {
        assert_eq!(engine.book_view(&Target::new(*symbol), 100).await.unwrap(), view);
    }
    engine.shutdown().await.unwrap();
}
