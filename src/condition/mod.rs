//! Condition evaluation.
//!
//! A detector's condition group is evaluated against one extracted value at a
//! time, producing a [`ProcessedConditionGroup`] with the aggregated logic
//! result and the priority it implies.

mod data_condition;
mod group;

pub use data_condition::{
    ConditionError, ConditionId, ConditionType, DataCondition, SlowConditionEvaluator,
};
pub use group::{
    process_condition_group, ConditionResult, DataConditionGroup, LogicResult, LogicType,
    ProcessedConditionGroup,
};
