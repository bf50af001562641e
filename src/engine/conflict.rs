//! Conflict resolution between rules that fired `block` in one phase
//!
//! Fired rules are partitioned by `conflict_group` in first-appearance
//! order. Each group is resolved with its strategy; when several groups
//! produce a winner, the one with the highest `conflict_priority` wins
//! (ties go to the earlier group).

use std::collections::HashMap;

use crate::input::Phase;
use crate::rules::{ConflictStrategy, PhaseScope, Rule};

/// What a custom resolver sees besides the group
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub phase: Phase,
    pub operation_name: String,
}

/// Picks the index of the winning member, or `None` to fall back
pub type CustomResolver = fn(&[&Rule], &ResolutionContext) -> Option<usize>;

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: Rule,
    /// `None` when there was nothing to resolve
    pub strategy: Option<ConflictStrategy>,
    pub groups: usize,
}

impl Resolution {
    pub fn is_conflict(&self) -> bool {
        self.strategy.is_some()
    }
}

pub struct ConflictResolver {
    custom: HashMap<String, CustomResolver>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        let mut resolver = Self::empty();
        resolver.register("most_severe", most_severe);
        resolver.register("phase_specific", phase_specific);
        resolver
    }
}

impl ConflictResolver {
    pub fn empty() -> Self {
        Self {
            custom: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, resolver: CustomResolver) {
        self.custom.insert(name.into(), resolver);
    }

    pub fn resolve(&self, fired: &[Rule], ctx: &ResolutionContext) -> Option<Resolution> {
        match fired {
            [] => return None,
            [only] => {
                return Some(Resolution {
                    winner: only.clone(),
                    strategy: None,
                    groups: 1,
                })
            }
            _ => {}
        }

        let groups = partition(fired);
        let mut winners: Vec<(Rule, ConflictStrategy)> = groups
            .iter()
            .map(|members| {
                let strategy = group_strategy(members);
                (self.apply(strategy, members, ctx), strategy)
            })
            .collect();

        // Stable: equal priorities keep group order
        winners.sort_by(|a, b| b.0.conflict_priority.cmp(&a.0.conflict_priority));
        let group_count = winners.len();
        let (winner, strategy) = winners.into_iter().next()?;

        tracing::debug!(
            winner = %winner.rule_code,
            strategy = ?strategy,
            groups = group_count,
            "conflict resolved"
        );

        Some(Resolution {
            winner,
            strategy: Some(strategy),
            groups: group_count,
        })
    }

    fn apply(&self, strategy: ConflictStrategy, members: &[&Rule], ctx: &ResolutionContext) -> Rule {
        match strategy {
            ConflictStrategy::Override => members[members.len() - 1].clone(),
            ConflictStrategy::FirstMatch => members[0].clone(),
            ConflictStrategy::HighestPriority => highest_priority(members).clone(),
            ConflictStrategy::Merge => merge(members),
            ConflictStrategy::Custom => self.custom(members, ctx),
        }
    }

    fn custom(&self, members: &[&Rule], ctx: &ResolutionContext) -> Rule {
        let name = members.iter().find_map(|rule| rule.custom_resolver.as_deref());
        let picked = name.and_then(|name| match self.custom.get(name) {
            Some(resolver) => resolver(members, ctx),
            None => {
                tracing::warn!(resolver = name, "unknown custom conflict resolver");
                None
            }
        });

        match picked.and_then(|idx| members.get(idx)) {
            Some(rule) => (*rule).clone(),
            None => highest_priority(members).clone(),
        }
    }
}

/// Groups in first-appearance order, members in input order
fn partition(fired: &[Rule]) -> Vec<Vec<&Rule>> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: HashMap<&str, Vec<&Rule>> = HashMap::new();

    for rule in fired {
        let group = rule.conflict_group.as_str();
        if !groups.contains_key(group) {
            order.push(group);
        }
        groups.entry(group).or_default().push(rule);
    }

    order
        .into_iter()
        .filter_map(|group| groups.remove(group))
        .collect()
}

/// Shared strategy, or the one of the highest-`conflict_priority` member
fn group_strategy(members: &[&Rule]) -> ConflictStrategy {
    let first = members[0].conflict_strategy;
    if members.iter().all(|rule| rule.conflict_strategy == first) {
        return first;
    }
    highest_priority(members).conflict_strategy
}

/// Max `conflict_priority`; ties go to the first
fn highest_priority<'a>(members: &[&'a Rule]) -> &'a Rule {
    let mut best = members[0];
    for &rule in &members[1..] {
        if rule.conflict_priority > best.conflict_priority {
            best = rule;
        }
    }
    best
}

/// Virtual rule standing for the whole group
fn merge(members: &[&Rule]) -> Rule {
    let codes: Vec<&str> = members.iter().map(|rule| rule.rule_code.as_str()).collect();
    let messages: Vec<String> = members.iter().map(|rule| rule.display_message()).collect();
    let suggestions: Vec<&str> = members
        .iter()
        .filter_map(|rule| rule.suggestion.as_deref())
        .collect();

    let mut merged = members[0].clone();
    merged.rule_code = codes.join("+");
    merged.name = format!("merged {}", codes.join(", "));
    merged.severity = members.iter().map(|rule| rule.severity).max().unwrap_or_default();
    merged.conflict_priority = members
        .iter()
        .map(|rule| rule.conflict_priority)
        .max()
        .unwrap_or(merged.conflict_priority);
    merged.priority = members.iter().map(|rule| rule.priority).max().unwrap_or(merged.priority);
    merged.message = Some(messages.join("; "));
    merged.suggestion = if suggestions.is_empty() {
        None
    } else {
        Some(suggestions.join("; "))
    };
    merged
}

/// Most severe member; ties go to the first
fn most_severe(members: &[&Rule], _ctx: &ResolutionContext) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, rule) in members.iter().enumerate() {
        if best.map_or(true, |b| rule.severity > members[b].severity) {
            best = Some(idx);
        }
    }
    best
}

/// Prefer rules scoped to exactly this phase over `all`-phase rules
fn phase_specific(members: &[&Rule], ctx: &ResolutionContext) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, rule) in members.iter().enumerate() {
        if rule.phase_scope == PhaseScope::All || !rule.phase_scope.covers(ctx.phase) {
            continue;
        }
        if best.map_or(true, |b| rule.conflict_priority > members[b].conflict_priority) {
            best = Some(idx);
        }
    }
    best
}
