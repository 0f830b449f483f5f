use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Workflow stages, declared in execution order so the derived `Ord` matches it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Add,
    Search,
    Answer,
    Evaluate,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Add, Stage::Search, Stage::Answer, Stage::Evaluate];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Search => "search",
            Self::Answer => "answer",
            Self::Evaluate => "evaluate",
        }
    }

    /// Name of the result-store artifact holding this stage's output.
    pub fn artifact_name(self) -> &'static str {
        match self {
            Self::Add => "add_results.json",
            Self::Search => "search_results.json",
            Self::Answer => "answer_results.json",
            Self::Evaluate => "eval_results.json",
        }
    }

    pub fn prerequisite(self) -> Option<Stage> {
        match self {
            Self::Add => None,
            Self::Search => Some(Self::Add),
            Self::Answer => Some(Self::Search),
            Self::Evaluate => Some(Self::Answer),
        }
    }

    pub fn required_by(self, downstream: Stage) -> bool {
        downstream.prerequisite() == Some(self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(Self::Add),
            "search" => Ok(Self::Search),
            "answer" => Ok(Self::Answer),
            "evaluate" | "eval" => Ok(Self::Evaluate),
            other => bail!("unknown stage: {other}"),
        }
    }
}

pub type StageSet = BTreeSet<Stage>;

pub fn all_stages() -> StageSet {
    Stage::ALL.into_iter().collect()
}

/// What the orchestrator does with one stage in a given run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StageAction {
    /// Requested and not yet completed: execute it.
    Run,
    /// Completed in an earlier run: recover its output instead of executing.
    Reload,
    /// Not requested, not completed, but a stage that runs now consumes its output.
    LoadPrerequisite,
    /// Not requested and nothing downstream needs it.
    Skip,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StagePlan {
    pub stage: Stage,
    pub action: StageAction,
    /// True when the next stage executes in this run and consumes this stage's output.
    pub needed_downstream: bool,
}

/// Resolves the gate for every stage. Walks the stages backwards so each stage knows
/// whether its consumer will execute; the result is in execution order.
pub fn plan_stages(requested: &StageSet, completed: &StageSet) -> Vec<StagePlan> {
    let mut plans = Vec::with_capacity(Stage::ALL.len());
    let mut running_downstream = Vec::<Stage>::new();

    for stage in Stage::ALL.into_iter().rev() {
        let needed_downstream = running_downstream
            .iter()
            .any(|downstream| stage.required_by(*downstream));

        let action = if completed.contains(&stage) {
            StageAction::Reload
        } else if requested.contains(&stage) {
            StageAction::Run
        } else if needed_downstream {
            StageAction::LoadPrerequisite
        } else {
            StageAction::Skip
        };

        if action == StageAction::Run {
            running_downstream.push(stage);
        }

        plans.push(StagePlan {
            stage,
            action,
            needed_downstream,
        });
    }

    plans.reverse();
    plans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(stages: &[Stage]) -> StageSet {
        stages.iter().copied().collect()
    }

    fn actions(plans: &[StagePlan]) -> Vec<StageAction> {
        plans.iter().map(|plan| plan.action).collect()
    }

    #[test]
    fn fresh_full_run_executes_every_stage() {
        let plans = plan_stages(&all_stages(), &StageSet::new());
        assert_eq!(actions(&plans), vec![StageAction::Run; 4]);
        assert!(plans[0].needed_downstream);
        assert!(!plans[3].needed_downstream);
    }

    #[test]
    fn completed_stages_reload_even_when_requested() {
        let plans = plan_stages(&all_stages(), &set(&[Stage::Add, Stage::Search]));
        assert_eq!(
            actions(&plans),
            vec![
                StageAction::Reload,
                StageAction::Reload,
                StageAction::Run,
                StageAction::Run
            ]
        );
        assert!(!plans[0].needed_downstream);
        assert!(plans[1].needed_downstream);
    }

    #[test]
    fn evaluate_only_needs_answers_but_not_search() {
        let plans = plan_stages(&set(&[Stage::Evaluate]), &StageSet::new());
        assert_eq!(
            actions(&plans),
            vec![
                StageAction::Skip,
                StageAction::Skip,
                StageAction::LoadPrerequisite,
                StageAction::Run
            ]
        );
    }

    #[test]
    fn add_only_skips_everything_downstream() {
        let plans = plan_stages(&set(&[Stage::Add]), &StageSet::new());
        assert_eq!(
            actions(&plans),
            vec![
                StageAction::Run,
                StageAction::Skip,
                StageAction::Skip,
                StageAction::Skip
            ]
        );
    }

    #[test]
    fn search_without_add_recovers_the_index() {
        let plans = plan_stages(&set(&[Stage::Search]), &StageSet::new());
        assert_eq!(plans[0].action, StageAction::LoadPrerequisite);
        assert_eq!(plans[1].action, StageAction::Run);
    }

    #[test]
    fn stage_names_parse_case_insensitively() {
        assert_eq!("Search".parse::<Stage>().expect("parse"), Stage::Search);
        assert_eq!("eval".parse::<Stage>().expect("parse"), Stage::Evaluate);
        assert!("index".parse::<Stage>().is_err());
    }

    #[test]
    fn stage_sets_serialize_in_execution_order() {
        let stages = set(&[Stage::Evaluate, Stage::Add]);
        let raw = serde_json::to_string(&stages).expect("serialize");
        assert_eq!(raw, r#"["add","evaluate"]"#);
    }
}
