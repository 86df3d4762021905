// Condition evaluation for availability gates and result selection

//! # Condition Evaluator
//!
//! Evaluates `{type: and|or, list: [...]}` condition trees. Each leaf is a
//! function reference resolved through the [`FunctionRegistry`] as a
//! predicate.
//!
//! ## Evaluation Rules
//!
//! - **and**: stops at the first failing leaf; an empty list passes
//! - **or**: stops at the first passing leaf; an empty list fails
//!
//! Leaves are evaluated in order and never re-run, so a predicate with side
//! effects (logging, metrics) is called at most once per evaluation.
//!
//! ## Result Selection
//!
//! [`ConditionEvaluator::available_result`] walks an action's ordered
//! results:
//! - a result **with** conditions is returned as soon as they pass
//! - a result **without** conditions becomes the tentative pick, and a later
//!   unconditioned result replaces it
//!
//! So `[{conditions: fails}, {no conditions}, {conditions: passes, step: S}]`
//! selects `S`, while `[{no conditions, step: A}, {no conditions, step: B}]`
//! selects `B`.

use std::sync::Arc;

use crate::engine::functions::{FunctionContext, FunctionRegistry};
use crate::models::{ConditionType, Conditions, ResultDescriptor};
use crate::Result;

/// Evaluates condition trees against registered predicates
#[derive(Clone)]
pub struct ConditionEvaluator {
    functions: Arc<FunctionRegistry>,
}

impl ConditionEvaluator {
    pub fn new(functions: Arc<FunctionRegistry>) -> Self {
        Self { functions }
    }

    /// Evaluate a condition tree
    pub async fn passes(&self, conditions: &Conditions, ctx: &FunctionContext) -> Result<bool> {
        match conditions.kind {
            ConditionType::And => {
                for condition in &conditions.list {
                    if !self.functions.check(condition, ctx).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionType::Or => {
                for condition in &conditions.list {
                    if self.functions.check(condition, ctx).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Availability check for an action or step gate
    ///
    /// No gate means available.
    pub async fn is_available(&self, gate: Option<&Conditions>, ctx: &FunctionContext) -> Result<bool> {
        match gate {
            Some(conditions) => self.passes(conditions, ctx).await,
            None => Ok(true),
        }
    }

    /// Pick the result an action leads to
    ///
    /// `None` when no result qualifies (including an empty list).
    pub async fn available_result<'a>(
        &self,
        results: &'a [ResultDescriptor],
        ctx: &FunctionContext,
    ) -> Result<Option<&'a ResultDescriptor>> {
        let mut selected = None;
        for result in results {
            match &result.conditions {
                Some(conditions) => {
                    if self.passes(conditions, ctx).await? {
                        return Ok(Some(result));
                    }
                }
                None => selected = Some(result),
            }
        }
        Ok(selected)
    }
}
