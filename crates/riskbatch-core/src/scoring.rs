use crate::ContractError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 100.0;
pub const LOWER_RISK_THRESHOLD: f64 = 33.0;
pub const UPPER_RISK_THRESHOLD: f64 = 66.0;

/// Whether a high score in a group is good news (`Positive`) or bad news.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

pub fn classify_risk(polarity: Polarity, score: f64) -> RiskLevel {
    match polarity {
        Polarity::Positive => {
            if score >= UPPER_RISK_THRESHOLD {
                RiskLevel::Low
            } else if score >= LOWER_RISK_THRESHOLD {
                RiskLevel::Medium
            } else {
                RiskLevel::High
            }
        }
        Polarity::Negative => {
            if score <= LOWER_RISK_THRESHOLD {
                RiskLevel::Low
            } else if score < UPPER_RISK_THRESHOLD {
                RiskLevel::Medium
            } else {
                RiskLevel::High
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupDefinition {
    pub number: u32,
    pub name: String,
    pub polarity: Polarity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupCatalog {
    groups: Vec<GroupDefinition>,
}

impl GroupCatalog {
    pub fn new(mut groups: Vec<GroupDefinition>) -> Self {
        groups.sort_by_key(|group| group.number);
        groups.dedup_by_key(|group| group.number);
        Self { groups }
    }

    pub fn groups(&self) -> &[GroupDefinition] {
        &self.groups
    }

    pub fn get(&self, number: u32) -> Option<&GroupDefinition> {
        self.groups.iter().find(|group| group.number == number)
    }
}

impl Default for GroupCatalog {
    fn default() -> Self {
        let groups = [
            (1, "Work demands", Polarity::Negative),
            (2, "Work organisation and content", Polarity::Positive),
            (3, "Social relations and leadership", Polarity::Positive),
            (4, "Work-individual interface", Polarity::Negative),
            (5, "Workplace values", Polarity::Positive),
            (6, "Self-efficacy", Polarity::Positive),
            (7, "Health and wellbeing", Polarity::Negative),
            (8, "Offensive behaviours", Polarity::Negative),
            (9, "Betting and gambling habits", Polarity::Negative),
            (10, "Financial indebtedness", Polarity::Negative),
        ]
        .into_iter()
        .map(|(number, name, polarity)| GroupDefinition {
            number,
            name: name.to_string(),
            polarity,
        })
        .collect();
        Self::new(groups)
    }
}

/// One stored answer. `seq` is the insertion order assigned by storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub seq: i64,
    pub group: u32,
    pub item: String,
    pub value: f64,
}

/// Keeps the most recently inserted answer for every (group, item).
pub fn latest_answers(answers: &[AnswerRecord]) -> Vec<&AnswerRecord> {
    let mut latest: BTreeMap<(u32, &str), &AnswerRecord> = BTreeMap::new();
    for answer in answers {
        let key = (answer.group, answer.item.as_str());
        match latest.get(&key) {
            Some(current) if current.seq >= answer.seq => {}
            _ => {
                latest.insert(key, answer);
            }
        }
    }
    latest.into_values().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupScore {
    pub group: u32,
    pub score: f64,
    pub answered_items: u32,
}

/// Per-group mean of the latest answer to each item.
pub fn compute_group_scores(answers: &[AnswerRecord]) -> Result<Vec<GroupScore>, ContractError> {
    let mut sums: BTreeMap<u32, (f64, u32)> = BTreeMap::new();
    for answer in latest_answers(answers) {
        if !answer.value.is_finite() || !(SCORE_MIN..=SCORE_MAX).contains(&answer.value) {
            return Err(ContractError::AnswerOutOfRange {
                group: answer.group,
                item: answer.item.clone(),
                value: answer.value,
            });
        }
        let entry = sums.entry(answer.group).or_insert((0.0, 0));
        entry.0 += answer.value;
        entry.1 += 1;
    }

    Ok(sums
        .into_iter()
        .map(|(group, (sum, count))| GroupScore {
            group,
            score: round2(sum / f64::from(count)),
            answered_items: count,
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatistics {
    pub group: u32,
    pub name: String,
    pub polarity: Polarity,
    pub respondents: u32,
    pub mean: f64,
    pub std_dev: f64,
    pub risk: RiskLevel,
}

/// Aggregates the per-assessment scores of one group across a batch.
pub fn summarize_group(definition: &GroupDefinition, scores: &[f64]) -> Option<GroupStatistics> {
    if scores.is_empty() {
        return None;
    }
    let count = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / count;
    let variance = scores
        .iter()
        .map(|score| {
            let delta = score - mean;
            delta * delta
        })
        .sum::<f64>()
        / count;

    Some(GroupStatistics {
        group: definition.number,
        name: definition.name.clone(),
        polarity: definition.polarity,
        respondents: scores.len() as u32,
        mean: round2(mean),
        std_dev: round2(variance.sqrt()),
        risk: classify_risk(definition.polarity, mean),
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
