//! Control rules
//!
//! Rules are evaluated between routing steps at the configured rule
//! step. A rule is a premise chain (IF/AND/OR) over live node, link, and
//! clock variables and two action lists (THEN/ELSE). Actions set link
//! target settings, node lateral inflows, or outfall stages; when two
//! rules drive the same target in one pass, the higher priority wins,
//! ties going to the later rule.

use crate::error::{EngineError, Result};
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// A live quantity a premise can test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "var", rename_all = "kebab-case")]
pub enum RuleVar {
    NodeDepth { node: String },
    NodeHead { node: String },
    NodeInflow { node: String },
    LinkFlow { link: String },
    LinkDepth { link: String },
    LinkSetting { link: String },
    PumpStatus { link: String },
    /// elapsed simulation time, hours
    SimTime,
    /// hour of the wall clock, 0..24
    ClockTime,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl RelOp {
    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            RelOp::Eq => (lhs - rhs).abs() < 1e-9,
            RelOp::Ne => (lhs - rhs).abs() >= 1e-9,
            RelOp::Lt => lhs < rhs,
            RelOp::Gt => lhs > rhs,
            RelOp::Le => lhs <= rhs,
            RelOp::Ge => lhs >= rhs,
        }
    }
}

/// How a premise joins the chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Conjunction {
    #[default]
    And,
    Or,
}

/// One IF/AND/OR clause.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Premise {
    #[serde(default)]
    pub join: Conjunction,
    #[serde(flatten)]
    pub var: RuleVar,
    pub op: RelOp,
    pub value: f64,
}

/// A THEN/ELSE action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum RuleAction {
    SetLinkSetting { link: String, value: f64 },
    SetPumpStatus { link: String, on: bool },
    SetNodeInflow { node: String, value: f64 },
    SetOutfallStage { node: String, value: f64 },
}

impl RuleAction {
    /// Target identity used for priority conflict resolution.
    pub fn target(&self) -> (&'static str, &str) {
        match self {
            RuleAction::SetLinkSetting { link, .. } => ("link", link),
            RuleAction::SetPumpStatus { link, .. } => ("link", link),
            RuleAction::SetNodeInflow { node, .. } => ("node-inflow", node),
            RuleAction::SetOutfallStage { node, .. } => ("outfall", node),
        }
    }
}

/// A complete control rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRule {
    pub id: String,
    pub premises: Vec<Premise>,
    #[serde(rename = "then")]
    pub then_actions: Vec<RuleAction>,
    #[serde(default, rename = "else")]
    pub else_actions: Vec<RuleAction>,
    #[serde(default)]
    pub priority: f64,
}

impl ControlRule {
    pub fn validate(&self) -> Result<()> {
        if self.premises.is_empty() {
            return Err(EngineError::RuleFormat(
                self.id.clone(),
                "a rule needs at least one premise".into(),
            ));
        }
        if self.then_actions.is_empty() && self.else_actions.is_empty() {
            return Err(EngineError::RuleFormat(
                self.id.clone(),
                "a rule needs at least one action".into(),
            ));
        }
        Ok(())
    }

    /// Evaluate the premise chain left to right: AND binds to the running
    /// result, OR starts a new alternative.
    pub fn evaluate(&self, lookup: &dyn Fn(&RuleVar) -> Option<f64>) -> bool {
        let mut result = false;
        let mut group = true;
        for (i, p) in self.premises.iter().enumerate() {
            let value = lookup(&p.var);
            let holds = value.map(|v| p.op.holds(v, p.value)).unwrap_or(false);
            if i == 0 {
                group = holds;
            } else {
                match p.join {
                    Conjunction::And => group = group && holds,
                    Conjunction::Or => {
                        result = result || group;
                        group = holds;
                    }
                }
            }
        }
        result || group
    }

    /// Actions selected by the premise outcome.
    pub fn actions(&self, premises_hold: bool) -> &[RuleAction] {
        if premises_hold {
            &self.then_actions
        } else {
            &self.else_actions
        }
    }
}

/// Elapsed- and clock-time values handed to premise evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RuleClock {
    /// elapsed simulation time, hours
    pub sim_hours: f64,
    pub now: NaiveDateTime,
}

impl RuleClock {
    pub fn value(&self, var: &RuleVar) -> Option<f64> {
        match var {
            RuleVar::SimTime => Some(self.sim_hours),
            RuleVar::ClockTime => {
                Some(self.now.hour() as f64 + self.now.minute() as f64 / 60.0)
            }
            _ => None,
        }
    }
}

/// Resolve one evaluation pass over all rules into the winning action per
/// target: higher priority wins, later rules break ties.
pub fn winning_actions<'a>(
    fired: impl Iterator<Item = (&'a ControlRule, bool)>,
) -> Vec<&'a RuleAction> {
    let mut winners: Vec<(&str, &str, f64, &RuleAction)> = Vec::new();
    for (rule, holds) in fired {
        for action in rule.actions(holds) {
            let (kind, name) = action.target();
            match winners
                .iter_mut()
                .find(|(k, n, _, _)| *k == kind && n.eq_ignore_ascii_case(name))
            {
                Some(slot) => {
                    if rule.priority >= slot.2 {
                        slot.2 = rule.priority;
                        slot.3 = action;
                    }
                }
                None => winners.push((kind, name, rule.priority, action)),
            }
        }
    }
    winners.into_iter().map(|(_, _, _, a)| a).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth_rule(threshold: f64) -> ControlRule {
        ControlRule {
            id: "R1".into(),
            premises: vec![Premise {
                join: Conjunction::And,
                var: RuleVar::NodeDepth { node: "SU1".into() },
                op: RelOp::Gt,
                value: threshold,
            }],
            then_actions: vec![RuleAction::SetPumpStatus {
                link: "P1".into(),
                on: true,
            }],
            else_actions: vec![RuleAction::SetPumpStatus {
                link: "P1".into(),
                on: false,
            }],
            priority: 0.0,
        }
    }

    #[test]
    fn simple_depth_rule_fires_then_and_else() {
        let rule = depth_rule(4.0);
        let deep = |_: &RuleVar| Some(5.0);
        let shallow = |_: &RuleVar| Some(2.0);
        assert!(rule.evaluate(&deep));
        assert!(!rule.evaluate(&shallow));
        assert!(matches!(
            rule.actions(true)[0],
            RuleAction::SetPumpStatus { on: true, .. }
        ));
    }

    #[test]
    fn or_chain_groups_like_the_classic_engine() {
        // IF depth > 4 AND flow > 1 OR depth > 8
        let rule = ControlRule {
            id: "R2".into(),
            premises: vec![
                Premise {
                    join: Conjunction::And,
                    var: RuleVar::NodeDepth { node: "N".into() },
                    op: RelOp::Gt,
                    value: 4.0,
                },
                Premise {
                    join: Conjunction::And,
                    var: RuleVar::LinkFlow { link: "L".into() },
                    op: RelOp::Gt,
                    value: 1.0,
                },
                Premise {
                    join: Conjunction::Or,
                    var: RuleVar::NodeDepth { node: "N".into() },
                    op: RelOp::Gt,
                    value: 8.0,
                },
            ],
            then_actions: vec![RuleAction::SetLinkSetting {
                link: "L".into(),
                value: 1.0,
            }],
            else_actions: vec![],
            priority: 0.0,
        };
        // depth 9, flow 0: first group fails, OR alternative holds
        let lookup = |v: &RuleVar| match v {
            RuleVar::NodeDepth { .. } => Some(9.0),
            RuleVar::LinkFlow { .. } => Some(0.0),
            _ => None,
        };
        assert!(rule.evaluate(&lookup));
        // depth 5, flow 0: both alternatives fail
        let lookup = |v: &RuleVar| match v {
            RuleVar::NodeDepth { .. } => Some(5.0),
            RuleVar::LinkFlow { .. } => Some(0.0),
            _ => None,
        };
        assert!(!rule.evaluate(&lookup));
    }

    #[test]
    fn higher_priority_rule_wins_the_target() {
        let mut low = depth_rule(4.0);
        low.priority = 1.0;
        let mut high = depth_rule(4.0);
        high.id = "R2".into();
        high.priority = 5.0;
        high.then_actions = vec![RuleAction::SetPumpStatus {
            link: "P1".into(),
            on: false,
        }];
        let fired = [(&low, true), (&high, true)];
        let winners = winning_actions(fired.into_iter());
        assert_eq!(winners.len(), 1);
        assert!(matches!(
            winners[0],
            RuleAction::SetPumpStatus { on: false, .. }
        ));
    }

    #[test]
    fn rule_without_premises_is_rejected() {
        let rule = ControlRule {
            id: "BAD".into(),
            premises: vec![],
            then_actions: vec![],
            else_actions: vec![],
            priority: 0.0,
        };
        assert!(matches!(
            rule.validate(),
            Err(EngineError::RuleFormat(_, _))
        ));
    }
}
