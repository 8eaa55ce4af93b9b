//! Replay command implementation
//!
//! Feeds a JSON order script through a fresh exchange and prints the fills,
//! final books and portfolios.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use competition_exchange::engine::OrderFilter;
use competition_exchange::oms::{OrderId, OrderRequest};
use competition_exchange::{Config, Exchange, Money, Quantity, SessionId, UserId};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct Script {
    session: SessionId,
    #[serde(default)]
    name: Option<String>,
    participants: Vec<UserId>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Step {
    Submit {
        /// Name later steps use to refer to this order
        #[serde(default)]
        label: Option<String>,
        #[serde(flatten)]
        order: OrderRequest,
    },
    Cancel {
        user: UserId,
        label: String,
    },
    Amend {
        user: UserId,
        label: String,
        #[serde(default)]
        price: Option<Money>,
        #[serde(default)]
        quantity: Option<Quantity>,
    },
    /// Run the expiry sweep as if `advance_hours` had passed
    Sweep {
        #[serde(default)]
        advance_hours: i64,
    },
}

pub fn run(config_path: String, script_path: String, state_dir: Option<String>) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);
    if let Some(dir) = state_dir {
        info!("Persisting state to: {}", dir);
        config.storage.state_dir = Some(PathBuf::from(dir));
    }

    let contents = std::fs::read_to_string(&script_path)
        .with_context(|| format!("Failed to read script {}", script_path))?;
    let script: Script = serde_json::from_str(&contents).context("Failed to parse replay script")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    runtime.block_on(replay(config, script))
}

async fn replay(config: Config, script: Script) -> Result<()> {
    let symbols = config.symbols();
    let persistent = config.storage.state_dir.is_some();
    let exchange = Exchange::from_config(config)?;
    if persistent {
        let report = exchange.recover().await?;
        info!("Recovered state: {:?}", report);
    }

    let name = script.name.clone().unwrap_or_else(|| script.session.to_string());
    if exchange.session_info(&script.session).is_none() {
        exchange.create_session(script.session.clone(), name);
    }
    exchange.open_session(&script.session)?;
    for user in &script.participants {
        exchange.join_session(&script.session, user)?;
    }

    let mut labels: HashMap<String, OrderId> = HashMap::new();
    for (n, step) in script.steps.into_iter().enumerate() {
        let n = n + 1;
        match step {
            Step::Submit { label, order } => {
                let desc = format!(
                    "{} {} {} {} {}",
                    order.user,
                    order.side,
                    order.quantity,
                    order.symbol,
                    order
                        .limit_price
                        .map(|p| format!("@ {}", p))
                        .unwrap_or_else(|| "at market".to_string())
                );
                match exchange.submit_order(order).await {
                    Ok(execution) => {
                        println!(
                            "[{n:>3}] {desc} -> #{} {}",
                            execution.order.id, execution.order.status
                        );
                        for trade in &execution.trades {
                            println!(
                                "        fill {} @ {} ({}, commission {})",
                                trade.quantity,
                                trade.price,
                                trade.liquidity.as_str(),
                                trade.commission
                            );
                        }
                        if let Some(label) = label {
                            labels.insert(label, execution.order.id);
                        }
                    }
                    Err(e) => println!("[{n:>3}] {desc} -> {e}"),
                }
            }
            Step::Cancel { user, label } => {
                let Some(&id) = labels.get(&label) else {
                    warn!("Step {}: unknown order label {}", n, label);
                    continue;
                };
                match exchange.cancel_order(&user, id).await {
                    Ok(order) => println!(
                        "[{n:>3}] cancel #{id} -> {} ({} filled)",
                        order.status, order.filled_quantity
                    ),
                    Err(e) => println!("[{n:>3}] cancel #{id} -> {e}"),
                }
            }
            Step::Amend {
                user,
                label,
                price,
                quantity,
            } => {
                let Some(&id) = labels.get(&label) else {
                    warn!("Step {}: unknown order label {}", n, label);
                    continue;
                };
                match exchange.amend_order(&user, id, price, quantity).await {
                    Ok(execution) => println!(
                        "[{n:>3}] amend #{id} -> {} remaining {}, {} new fills",
                        execution.order.status,
                        execution.order.remaining_quantity,
                        execution.trades.len()
                    ),
                    Err(e) => println!("[{n:>3}] amend #{id} -> {e}"),
                }
            }
            Step::Sweep { advance_hours } => {
                let expired = exchange
                    .sweep_expired_at(Utc::now() + Duration::hours(advance_hours))
                    .await;
                println!("[{n:>3}] sweep +{advance_hours}h -> {} expired", expired.len());
            }
        }
    }

    println!("\n{}", "=".repeat(60));
    println!("ORDER BOOKS");
    println!("{}", "=".repeat(60));
    for symbol in &symbols {
        let book = exchange.get_order_book(&script.session, symbol, 5).await?;
        println!("{} (last {:?})", symbol, book.last_trade_price.map(|p| p.to_string()));
        for level in book.asks.iter().rev() {
            println!(
                "    ask {:>10} x {:<6} ({} orders)",
                level.price, level.quantity, level.order_count
            );
        }
        for level in &book.bids {
            println!(
                "    bid {:>10} x {:<6} ({} orders)",
                level.price, level.quantity, level.order_count
            );
        }
    }

    println!("\n{}", "=".repeat(60));
    println!("PORTFOLIOS");
    println!("{}", "=".repeat(60));
    for user in &script.participants {
        let Some(summary) = exchange.portfolio_summary(&script.session, user).await else {
            continue;
        };
        let history = exchange
            .order_history(
                user,
                &OrderFilter {
                    session: Some(script.session.clone()),
                    ..Default::default()
                },
            )
            .await;
        println!(
            "{:<10} cash {:>12}  reserved {:>10}  value {:>12}  realized {:>9}  unrealized {:>9}  orders {}",
            summary.user,
            summary.cash.round_dp(2),
            summary.reserved_cash.round_dp(2),
            summary.total_value.round_dp(2),
            summary.realized_pnl.round_dp(2),
            summary.unrealized_pnl.round_dp(2),
            history.len()
        );
        for holding in &summary.holdings {
            println!(
                "           {:<8} {:>6} @ {:<10} mark {}",
                holding.symbol,
                holding.quantity,
                holding.average_cost.round_dp(4),
                holding.reference_price
            );
        }
    }
    println!("{}", "=".repeat(60));

    Ok(())
}
