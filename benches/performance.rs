//! Performance benchmarks for the competition exchange
//!
//! Run with: `cargo bench`
//! View results: `open target/criterion/report/index.html`

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use competition_exchange::oms::{match_incoming, Order, OrderBook, OrderRequest, OrderStatus};
use competition_exchange::{Config, Exchange, Money, SessionId, Side, UserId};

/// A book with `levels` ask levels of `per_level` orders each, from 100 upward
fn deep_book(levels: i64, per_level: usize) -> OrderBook {
    let mut book = OrderBook::new();
    for level in 0..levels {
        for n in 0..per_level {
            let request = OrderRequest::limit(
                format!("maker{n}").as_str(),
                "bench",
                "ACME",
                Side::Sell,
                10,
                Money::from_i64(100 + level),
            );
            let mut order = Order::from_request(&request, Utc::now());
            order.transition(OrderStatus::Open, Utc::now());
            let _ = book.add_order(order);
        }
    }
    book
}

fn benchmark_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_incoming");
    for levels in [10i64, 100] {
        let book = deep_book(levels, 10);
        group.bench_with_input(BenchmarkId::from_parameter(levels), &book, |b, book| {
            b.iter(|| {
                match_incoming(
                    black_box(book),
                    Side::Buy,
                    black_box(500),
                    Some(Money::from_i64(100 + levels)),
                )
            })
        });
    }
    group.finish();

    let book = deep_book(100, 10);
    c.bench_function("book_snapshot_depth_10", |b| {
        b.iter(|| book.snapshot(&"ACME".into(), black_box(10), None))
    });
}

fn benchmark_submit(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut config = Config::default()
        .with_rate_limit(u32::MAX, 60)
        .with_instrument("ACME", Money::from_i64(100));
    config.engine.impact_factor = Money::ZERO;

    let exchange = Exchange::from_config(config).unwrap();
    let session = SessionId::new("bench");
    exchange.create_session(session.clone(), "Bench");
    exchange.open_session(&session).unwrap();
    for user in ["buyer", "seller"] {
        exchange.join_session(&session, &UserId::new(user)).unwrap();
    }
    let seed = OrderRequest::market("seller", "bench", "ACME", Side::Buy, 900);
    runtime.block_on(exchange.submit_order(seed)).unwrap();

    c.bench_function("submit_round_trip", |b| {
        b.iter(|| {
            runtime.block_on(async {
                // shares go out and come back, so the accounts only drain commission
                for (seller, buyer) in [("seller", "buyer"), ("buyer", "seller")] {
                    let price = Money::from_i64(100);
                    let ask = OrderRequest::limit(seller, "bench", "ACME", Side::Sell, 1, price);
                    exchange.submit_order(ask).await.ok();
                    let bid = OrderRequest::limit(buyer, "bench", "ACME", Side::Buy, 1, price);
                    exchange.submit_order(bid).await.ok();
                }
            })
        })
    });
}

criterion_group!(benches, benchmark_matching, benchmark_submit);
criterion_main!(benches);
