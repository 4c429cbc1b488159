//! Aggregator - reduce per-unit outcomes to one result
//!
//! Only succeeded outcomes take part. Metrics are read from each output
//! either as a JSON pointer (`/score/value`) or as a top-level key (`score`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

use crate::dispatch::UnitOutcome;
use crate::store::canonical_json;

fn default_true() -> bool {
    true
}

/// Reduction strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Most frequent output; ties go to the earliest occurrence
    MajorityVote,
    /// Outputs ordered by a numeric metric
    RankBy {
        metric: String,
        #[serde(default = "default_true")]
        descending: bool,
        #[serde(default)]
        top_k: Option<usize>,
    },
    /// Single output with the best metric
    BestOf {
        metric: String,
        #[serde(default = "default_true")]
        maximize: bool,
    },
    /// Every successful output, in input order
    Collect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedOutput {
    pub unit_id: String,
    pub score: f64,
    pub output: Value,
}

/// Aggregated result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Aggregate {
    Vote {
        winner: Value,
        votes: usize,
        considered: usize,
    },
    Ranked {
        items: Vec<RankedOutput>,
    },
    Best {
        item: RankedOutput,
    },
    Collected {
        outputs: Vec<Value>,
    },
}

impl Aggregate {
    /// The aggregated payload without bookkeeping
    pub fn into_value(self) -> Value {
        match self {
            Self::Vote { winner, .. } => winner,
            Self::Ranked { items } => Value::Array(items.into_iter().map(|i| i.output).collect()),
            Self::Best { item } => item.output,
            Self::Collected { outputs } => Value::Array(outputs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    #[error("no successful outcomes to aggregate")]
    NoSuccessfulOutcomes,

    #[error("no successful outcome carries numeric metric '{0}'")]
    MissingMetric(String),
}

/// Reduce `outcomes` with `strategy`
pub fn aggregate(
    outcomes: &[UnitOutcome],
    strategy: &AggregationStrategy,
) -> Result<Aggregate, AggregateError> {
    let succeeded: Vec<&UnitOutcome> = outcomes.iter().filter(|o| o.is_success()).collect();

    match strategy {
        AggregationStrategy::Collect => Ok(Aggregate::Collected {
            outputs: succeeded.iter().map(|o| o.output.clone()).collect(),
        }),
        AggregationStrategy::MajorityVote => majority_vote(&succeeded),
        AggregationStrategy::RankBy {
            metric,
            descending,
            top_k,
        } => {
            let mut items = scored(&succeeded, metric)?;
            items.sort_by(|a, b| compare_scores(a.score, b.score, *descending));
            if let Some(k) = top_k {
                items.truncate(*k);
            }
            Ok(Aggregate::Ranked { items })
        }
        AggregationStrategy::BestOf { metric, maximize } => {
            let items = scored(&succeeded, metric)?;
            // first-best wins on ties
            let mut best: Option<RankedOutput> = None;
            for item in items {
                let better = match &best {
                    None => true,
                    Some(current) => {
                        compare_scores(item.score, current.score, *maximize) == Ordering::Less
                    }
                };
                if better {
                    best = Some(item);
                }
            }
            best.map(|item| Aggregate::Best { item })
                .ok_or_else(|| AggregateError::MissingMetric(metric.clone()))
        }
    }
}

fn majority_vote(succeeded: &[&UnitOutcome]) -> Result<Aggregate, AggregateError> {
    if succeeded.is_empty() {
        return Err(AggregateError::NoSuccessfulOutcomes);
    }
    // (canonical form, first output, votes) in first-seen order
    let mut tally: Vec<(String, &Value, usize)> = Vec::new();
    for outcome in succeeded {
        let key = canonical_json(&outcome.output);
        match tally.iter_mut().find(|(k, _, _)| *k == key) {
            Some(entry) => entry.2 += 1,
            None => tally.push((key, &outcome.output, 1)),
        }
    }
    let mut winner = &tally[0];
    for entry in &tally[1..] {
        if entry.2 > winner.2 {
            winner = entry;
        }
    }
    Ok(Aggregate::Vote {
        winner: winner.1.clone(),
        votes: winner.2,
        considered: succeeded.len(),
    })
}

fn scored(succeeded: &[&UnitOutcome], metric: &str) -> Result<Vec<RankedOutput>, AggregateError> {
    if succeeded.is_empty() {
        return Err(AggregateError::NoSuccessfulOutcomes);
    }
    let items: Vec<RankedOutput> = succeeded
        .iter()
        .filter_map(|outcome| match metric_value(&outcome.output, metric) {
            Some(score) => Some(RankedOutput {
                unit_id: outcome.unit_id.clone(),
                score,
                output: outcome.output.clone(),
            }),
            None => {
                tracing::debug!(
                    unit_id = %outcome.unit_id,
                    metric = %metric,
                    "outcome has no numeric metric, excluded from ranking"
                );
                None
            }
        })
        .collect();
    if items.is_empty() {
        return Err(AggregateError::MissingMetric(metric.to_string()));
    }
    Ok(items)
}

fn metric_value(output: &Value, metric: &str) -> Option<f64> {
    let value = if metric.starts_with('/') {
        output.pointer(metric)
    } else if metric.is_empty() {
        Some(output)
    } else {
        output.get(metric)
    }?;
    value.as_f64().filter(|v| v.is_finite())
}

/// `Less` means `a` ranks before `b`; stable sorts keep input order on ties
fn compare_scores(a: f64, b: f64, descending: bool) -> Ordering {
    if descending {
        b.total_cmp(&a)
    } else {
        a.total_cmp(&b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorInfo, StepStatus};
    use serde_json::json;

    fn ok(id: &str, output: Value) -> UnitOutcome {
        UnitOutcome::from_result(id.to_string(), Ok(output), 1, 1, false)
    }

    fn failed(id: &str) -> UnitOutcome {
        UnitOutcome::from_result(id.to_string(), Err(ErrorInfo::runtime("x")), 1, 1, false)
    }

    #[test]
    fn test_majority_vote_ignores_key_order_and_failures() {
        let outcomes = vec![
            ok("a", json!({"label": "cat", "p": 1})),
            ok("b", json!("dog")),
            failed("c"),
            ok("d", json!({"p": 1, "label": "cat"})),
        ];
        let result = aggregate(&outcomes, &AggregationStrategy::MajorityVote).expect("vote");
        assert_eq!(
            result,
            Aggregate::Vote {
                winner: json!({"label": "cat", "p": 1}),
                votes: 2,
                considered: 3
            }
        );
    }

    #[test]
    fn test_majority_vote_tie_goes_to_first_seen() {
        let outcomes = vec![ok("a", json!("x")), ok("b", json!("y"))];
        let result = aggregate(&outcomes, &AggregationStrategy::MajorityVote).expect("vote");
        assert_eq!(result.into_value(), json!("x"));
    }

    #[test]
    fn test_rank_by_pointer_with_top_k() {
        let outcomes = vec![
            ok("a", json!({"m": {"score": 0.2}})),
            ok("b", json!({"m": {"score": 0.9}})),
            ok("c", json!({"m": {}})),
            ok("d", json!({"m": {"score": 0.5}})),
        ];
        let strategy = AggregationStrategy::RankBy {
            metric: "/m/score".to_string(),
            descending: true,
            top_k: Some(2),
        };
        match aggregate(&outcomes, &strategy).expect("rank") {
            Aggregate::Ranked { items } => {
                let ids: Vec<&str> = items.iter().map(|i| i.unit_id.as_str()).collect();
                assert_eq!(ids, vec!["b", "d"]);
            }
            other => panic!("unexpected aggregate {:?}", other),
        }
    }

    #[test]
    fn test_best_of_minimize() {
        let outcomes = vec![
            ok("a", json!({"latency": 30})),
            ok("b", json!({"latency": 10})),
            ok("c", json!({"latency": 10})),
        ];
        let strategy = AggregationStrategy::BestOf {
            metric: "latency".to_string(),
            maximize: false,
        };
        match aggregate(&outcomes, &strategy).expect("best") {
            Aggregate::Best { item } => assert_eq!(item.unit_id, "b"),
            other => panic!("unexpected aggregate {:?}", other),
        }
    }

    #[test]
    fn test_collect_keeps_input_order() {
        let outcomes = vec![ok("a", json!(1)), failed("b"), ok("c", json!(3))];
        let result = aggregate(&outcomes, &AggregationStrategy::Collect).expect("collect");
        assert_eq!(result.into_value(), json!([1, 3]));
        assert_eq!(outcomes[1].status, StepStatus::Failed);
    }

    #[test]
    fn test_errors() {
        let outcomes = vec![failed("a")];
        assert_eq!(
            aggregate(&outcomes, &AggregationStrategy::MajorityVote),
            Err(AggregateError::NoSuccessfulOutcomes)
        );
        let outcomes = vec![ok("a", json!({"x": "not a number"}))];
        let strategy = AggregationStrategy::BestOf {
            metric: "x".to_string(),
            maximize: true,
        };
        assert_eq!(
            aggregate(&outcomes, &strategy),
            Err(AggregateError::MissingMetric("x".to_string()))
        );
    }

    #[test]
    fn test_strategy_deserializes_from_tagged_json() {
        let strategy: AggregationStrategy =
            serde_json::from_value(json!({"strategy": "rank_by", "metric": "score"}))
                .expect("strategy");
        assert_eq!(
            strategy,
            AggregationStrategy::RankBy {
                metric: "score".to_string(),
                descending: true,
                top_k: None
            }
        );
    }
}
