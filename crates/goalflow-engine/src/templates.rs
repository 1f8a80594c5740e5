//! Canonical workflow shapes for known objective classes.
//!
//! Every template is a pure builder: it reads the goal's constraints (falling
//! back to the defaults documented on each builder), wires a fixed set of
//! tasks with explicit dependencies, and returns a `Workflow` in status
//! Created. Nothing here touches the orchestrator.

use std::str::FromStr;

use serde_json::json;

use goalflow_core::config::TaskDefaults;
use goalflow_core::error::GoalflowError;
use goalflow_core::goal::Goal;
use goalflow_core::task::Task;
use goalflow_core::types::Priority;
use goalflow_core::workflow::Workflow;

/// Agent type keys used by the built-in templates.
pub mod agent_types {
    pub const PRICE_MONITOR: &str = "price_monitor";
    pub const MARKET_ANALYZER: &str = "market_analyzer";
    pub const TRADE_EXECUTOR: &str = "trade_executor";
    pub const YIELD_SCANNER: &str = "yield_scanner";
    pub const RISK_ANALYZER: &str = "risk_analyzer";
    pub const PORTFOLIO_MANAGER: &str = "portfolio_manager";
    pub const SENTIMENT_ANALYZER: &str = "sentiment_analyzer";
    pub const EXECUTOR: &str = "executor";
    pub const REPORTER: &str = "reporter";
}

use agent_types::*;

/// Default total reward split across a template's tasks.
pub const DEFAULT_REWARD_POOL: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    Arbitrage,
    YieldOptimization,
    PortfolioRebalance,
    SentimentTrading,
    Generic,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 5] = [
        Self::Arbitrage,
        Self::YieldOptimization,
        Self::PortfolioRebalance,
        Self::SentimentTrading,
        Self::Generic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Arbitrage => "arbitrage",
            Self::YieldOptimization => "yield_optimization",
            Self::PortfolioRebalance => "portfolio_rebalance",
            Self::SentimentTrading => "sentiment_trading",
            Self::Generic => "generic",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Arbitrage => "Monitor cross-venue prices, size the spread, trade it, report",
            Self::YieldOptimization => "Scan protocol yields, score risk, reallocate capital, report",
            Self::PortfolioRebalance => "Price holdings and assess risk in parallel, rebalance, report",
            Self::SentimentTrading => "Score social sentiment alongside prices, decide, trade, report",
            Self::Generic => "Analyze the objective, execute, report",
        }
    }

    /// Pick a template from the goal's metric and description.
    pub fn infer(goal: &Goal) -> Self {
        const KEYWORDS: &[(TemplateKind, &[&str])] = &[
            (TemplateKind::Arbitrage, &["arbitrage", "spread", "arb"]),
            (TemplateKind::YieldOptimization, &["yield", "apy", "apr", "farming"]),
            (TemplateKind::SentimentTrading, &["sentiment", "social"]),
            (
                TemplateKind::PortfolioRebalance,
                &["rebalance", "allocation", "portfolio"],
            ),
        ];

        let text = format!("{} {}", goal.target_metric, goal.description).to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        KEYWORDS
            .iter()
            .find(|(_, keys)| keys.iter().any(|k| words.contains(k)))
            .map(|(kind, _)| *kind)
            .unwrap_or(Self::Generic)
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TemplateKind {
    type Err = GoalflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.name() == normalized || (normalized == "yield" && *k == Self::YieldOptimization))
            .ok_or_else(|| GoalflowError::UnknownTemplate(s.to_string()))
    }
}

/// Build the canonical workflow for `kind`.
pub fn build(kind: TemplateKind, goal: Goal, user_id: &str, defaults: &TaskDefaults) -> Workflow {
    let tasks = match kind {
        TemplateKind::Arbitrage => arbitrage(&goal),
        TemplateKind::YieldOptimization => yield_optimization(&goal),
        TemplateKind::PortfolioRebalance => portfolio_rebalance(&goal),
        TemplateKind::SentimentTrading => sentiment_trading(&goal),
        TemplateKind::Generic => generic(&goal),
    };

    let common = common_params(&goal);
    let tasks: Vec<Task> = tasks
        .into_iter()
        .map(|t| {
            t.with_max_retries(defaults.max_retries)
                .with_timeout(defaults.timeout())
                .with_params(common.clone())
        })
        .collect();

    let name = format!("{}: {}", kind.name(), goal.description);
    Workflow::new(name, kind.description(), goal, user_id).with_tasks(tasks)
}

/// Parameters every template task receives.
fn common_params(goal: &Goal) -> std::collections::HashMap<String, serde_json::Value> {
    let mut params = std::collections::HashMap::new();
    params.insert("goal_id".into(), json!(goal.id));
    params.insert("target_metric".into(), json!(goal.target_metric));
    params.insert("target_value".into(), json!(goal.target_value));
    if let Some(deadline) = goal.deadline {
        params.insert("deadline".into(), json!(deadline.to_rfc3339()));
    }
    params
}

/// Split the `reward_pool` constraint (default 100.0) by `weight`.
fn reward(goal: &Goal, weight: f64) -> serde_json::Value {
    let pool = goal.constraint_f64("reward_pool", DEFAULT_REWARD_POOL);
    json!((pool * weight * 100.0).round() / 100.0)
}

/// monitor_prices → analyze_opportunity → execute_trade → report
///
/// Constraints: `token_pairs` (["ETH/USDC"]), `exchanges`
/// (["uniswap", "sushiswap"]), `poll_interval_secs` (5), `min_profit_bps` (30),
/// `max_slippage` (0.005), `max_position_usd` (10000).
fn arbitrage(goal: &Goal) -> Vec<Task> {
    vec![
        Task::new("monitor_prices", "Monitor prices", PRICE_MONITOR)
            .with_description("Collect quotes for every pair on every venue")
            .with_priority(Priority::High)
            .with_param("token_pairs", json!(goal.constraint_list("token_pairs", &["ETH/USDC"])))
            .with_param(
                "exchanges",
                json!(goal.constraint_list("exchanges", &["uniswap", "sushiswap"])),
            )
            .with_param("poll_interval_secs", json!(goal.constraint_f64("poll_interval_secs", 5.0)))
            .with_param("reward", reward(goal, 0.2)),
        Task::new("analyze_opportunity", "Analyze opportunity", MARKET_ANALYZER)
            .with_description("Find the widest spread net of fees")
            .depends_on("monitor_prices")
            .with_param("min_profit_bps", json!(goal.constraint_f64("min_profit_bps", 30.0)))
            .with_param("reward", reward(goal, 0.3)),
        Task::new("execute_trade", "Execute trade", TRADE_EXECUTOR)
            .with_description("Trade both legs of the chosen spread")
            .depends_on("analyze_opportunity")
            .with_priority(Priority::Critical)
            .with_param("max_slippage", json!(goal.constraint_f64("max_slippage", 0.005)))
            .with_param(
                "max_position_usd",
                json!(goal.constraint_f64("max_position_usd", 10_000.0)),
            )
            .with_param("reward", reward(goal, 0.4)),
        report_task("execute_trade", goal, 0.1),
    ]
}

/// scan_yields → assess_risk → reallocate → report
///
/// Constraints: `protocols` (["aave", "compound", "curve"]), `chains`
/// (["ethereum"]), `base_asset` ("USDC"), `min_tvl_usd` (1000000),
/// `max_risk_score` (0.3), `capital_usd` (10000).
fn yield_optimization(goal: &Goal) -> Vec<Task> {
    vec![
        Task::new("scan_yields", "Scan yields", YIELD_SCANNER)
            .with_description("Collect current APYs across protocols")
            .with_priority(Priority::High)
            .with_param(
                "protocols",
                json!(goal.constraint_list("protocols", &["aave", "compound", "curve"])),
            )
            .with_param("chains", json!(goal.constraint_list("chains", &["ethereum"])))
            .with_param("min_tvl_usd", json!(goal.constraint_f64("min_tvl_usd", 1_000_000.0)))
            .with_param("base_asset", json!(goal.constraint_str("base_asset", "USDC")))
            .with_param("reward", reward(goal, 0.25)),
        Task::new("assess_risk", "Assess risk", RISK_ANALYZER)
            .with_description("Score each candidate pool and drop the risky ones")
            .depends_on("scan_yields")
            .with_param("max_risk_score", json!(goal.constraint_f64("max_risk_score", 0.3)))
            .with_param("reward", reward(goal, 0.25)),
        Task::new("reallocate", "Reallocate capital", PORTFOLIO_MANAGER)
            .with_description("Move capital into the best surviving pool")
            .depends_on("assess_risk")
            .with_priority(Priority::Critical)
            .with_param("capital_usd", json!(goal.constraint_f64("capital_usd", 10_000.0)))
            .with_param("reward", reward(goal, 0.4)),
        report_task("reallocate", goal, 0.1),
    ]
}

/// (fetch_prices, assess_risk) → rebalance → report
///
/// Constraints: `target_allocation` ({"ETH": 0.5, "USDC": 0.5}),
/// `drift_threshold` (0.05), `max_risk_score` (0.5).
fn portfolio_rebalance(goal: &Goal) -> Vec<Task> {
    let allocation = goal
        .constraints
        .get("target_allocation")
        .cloned()
        .unwrap_or_else(|| json!({"ETH": 0.5, "USDC": 0.5}));
    let assets: Vec<String> = allocation
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();

    vec![
        Task::new("fetch_prices", "Fetch prices", PRICE_MONITOR)
            .with_description("Price every held asset")
            .with_priority(Priority::High)
            .with_param("assets", json!(assets))
            .with_param("reward", reward(goal, 0.2)),
        Task::new("assess_risk", "Assess risk", RISK_ANALYZER)
            .with_description("Score current exposure")
            .with_priority(Priority::High)
            .with_param("max_risk_score", json!(goal.constraint_f64("max_risk_score", 0.5)))
            .with_param("reward", reward(goal, 0.2)),
        Task::new("rebalance", "Rebalance", PORTFOLIO_MANAGER)
            .with_description("Trade back to the target allocation when drift exceeds the threshold")
            .depends_on("fetch_prices")
            .depends_on("assess_risk")
            .with_priority(Priority::Critical)
            .with_param("target_allocation", allocation)
            .with_param("drift_threshold", json!(goal.constraint_f64("drift_threshold", 0.05)))
            .with_param("reward", reward(goal, 0.5)),
        report_task("rebalance", goal, 0.1),
    ]
}

/// (score_sentiment, monitor_prices) → decide → execute_trade → report
///
/// Constraints: `sources` (["twitter", "reddit"]), `tokens` (["ETH"]),
/// `min_sentiment` (0.6), `max_position_usd` (5000), `max_slippage` (0.01).
fn sentiment_trading(goal: &Goal) -> Vec<Task> {
    let tokens = goal.constraint_list("tokens", &["ETH"]);
    vec![
        Task::new("score_sentiment", "Score sentiment", SENTIMENT_ANALYZER)
            .with_description("Aggregate social sentiment per token")
            .with_param("sources", json!(goal.constraint_list("sources", &["twitter", "reddit"])))
            .with_param("tokens", json!(tokens))
            .with_param("reward", reward(goal, 0.2)),
        Task::new("monitor_prices", "Monitor prices", PRICE_MONITOR)
            .with_description("Current prices for the scored tokens")
            .with_param("tokens", json!(tokens))
            .with_param("reward", reward(goal, 0.1)),
        Task::new("decide", "Decide position", MARKET_ANALYZER)
            .with_description("Combine sentiment and price into a trade decision")
            .depends_on("score_sentiment")
            .depends_on("monitor_prices")
            .with_param("min_sentiment", json!(goal.constraint_f64("min_sentiment", 0.6)))
            .with_param("reward", reward(goal, 0.3)),
        Task::new("execute_trade", "Execute trade", TRADE_EXECUTOR)
            .with_description("Open the decided position")
            .depends_on("decide")
            .with_priority(Priority::Critical)
            .with_param("max_position_usd", json!(goal.constraint_f64("max_position_usd", 5_000.0)))
            .with_param("max_slippage", json!(goal.constraint_f64("max_slippage", 0.01)))
            .with_param("reward", reward(goal, 0.3)),
        report_task("execute_trade", goal, 0.1),
    ]
}

/// analyze → execute → report
fn generic(goal: &Goal) -> Vec<Task> {
    vec![
        Task::new("analyze", "Analyze objective", MARKET_ANALYZER)
            .with_description(goal.description.clone())
            .with_param("constraints", json!(goal.constraints))
            .with_param("reward", reward(goal, 0.4)),
        Task::new("execute", "Execute plan", EXECUTOR)
            .depends_on("analyze")
            .with_param("reward", reward(goal, 0.5)),
        report_task("execute", goal, 0.1),
    ]
}

fn report_task(after: &str, goal: &Goal, weight: f64) -> Task {
    Task::new("report", "Report results", REPORTER)
        .with_description("Summarise the outcome against the goal")
        .depends_on(after)
        .with_priority(Priority::Low)
        .with_param("reward", reward(goal, weight))
}
