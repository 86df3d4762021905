// Function dispatcher - named hooks and condition predicates

//! # Function Registry
//!
//! Definitions refer to behavior by name: `"Notice@send"` as a post-action
//! hook, `"IsAssignee"` as a condition. This module maps those names to
//! capabilities registered at startup.
//!
//! - [`Hook`]: called for side effects (notifications, audit records, ...);
//!   nothing it returns is observed by the engine
//! - [`Predicate`]: answers a yes/no question for a condition tree
//!
//! A reference name has the form `Capability@entry_point`. When the entry
//! point is omitted it defaults to `handle`, so `"IsAssignee"` and
//! `"IsAssignee@handle"` resolve to the same registration.
//!
//! ## Function Context
//!
//! Every call receives a [`FunctionContext`] built from:
//! 1. every field of the entry (`id`, `definition_id`, `state`, `propertysets`, ...)
//! 2. `inputs`: the inputs of the current action
//! 3. the static `args` of the reference, which override 1 and 2
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects in a Registry
//! Registrations are stored as `Arc<dyn Hook>` / `Arc<dyn Predicate>`, so
//! any type implementing the trait can be plugged in, and the registry can
//! be shared between tasks cheaply.
//!
//! ### Closure Adapters
//! `register_hook_fn` wraps a plain closure in a small struct that
//! implements the trait. That keeps simple hooks one-liners without a
//! blanket `impl<F: Fn(..)> Hook for F` that would collide with user impls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::models::{DefinitionContents, Entry, FunctionRef};
use crate::{Result, WorkflowError};

/// Variables handed to a hook or predicate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionContext {
    vars: Map<String, Value>,
}

impl FunctionContext {
    /// Base context for one call: entry fields plus `inputs`
    pub fn new(entry: &Entry, inputs: &Map<String, Value>) -> Self {
        let mut vars = entry.to_vars();
        vars.insert("inputs".to_string(), Value::Object(inputs.clone()));
        Self { vars }
    }

    /// Copy of this context with a function's static args merged on top
    pub fn with_args(&self, args: &Map<String, Value>) -> Self {
        let mut vars = self.vars.clone();
        for (key, value) in args {
            vars.insert(key.clone(), value.clone());
        }
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// One value from the action inputs
    pub fn input(&self, key: &str) -> Option<&Value> {
        self.vars.get("inputs").and_then(|inputs| inputs.get(key))
    }

    /// One value from the entry's property bag
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.vars.get("propertysets").and_then(|props| props.get(key))
    }

    pub fn entry_id(&self) -> Option<Uuid> {
        self.vars
            .get("id")
            .and_then(|id| id.as_str())
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }
}

/// A side-effecting function run at a transition boundary
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, ctx: &FunctionContext) -> anyhow::Result<()>;
}

/// A boolean function used as a condition leaf
#[async_trait]
pub trait Predicate: Send + Sync {
    async fn check(&self, ctx: &FunctionContext) -> anyhow::Result<bool>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&FunctionContext) -> anyhow::Result<()> + Send + Sync,
{
    async fn call(&self, ctx: &FunctionContext) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

struct FnPredicate<F>(F);

#[async_trait]
impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&FunctionContext) -> anyhow::Result<bool> + Send + Sync,
{
    async fn check(&self, ctx: &FunctionContext) -> anyhow::Result<bool> {
        (self.0)(ctx)
    }
}

/// Registry of named hooks and predicates
///
/// Populated once at startup and then shared read-only (usually behind an
/// `Arc`) by every engine instance.
pub struct FunctionRegistry {
    delimiter: String,
    default_entry_point: String,
    hooks: HashMap<String, Arc<dyn Hook>>,
    predicates: HashMap<String, Arc<dyn Predicate>>,
}

impl FunctionRegistry {
    /// Empty registry using `@` and `handle`
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            delimiter: config.function_delimiter.clone(),
            default_entry_point: config.default_entry_point.clone(),
            hooks: HashMap::new(),
            predicates: HashMap::new(),
        }
    }

    /// Whether names resolve with the delimiter and default entry point of `config`
    pub fn uses_naming_of(&self, config: &EngineConfig) -> bool {
        self.delimiter == config.function_delimiter && self.default_entry_point == config.default_entry_point
    }

    /// Normalize a reference name to `Capability<delim>entry_point`
    pub fn resolve_name(&self, name: &str) -> String {
        let mut parts = name.splitn(2, self.delimiter.as_str());
        let capability = parts.next().unwrap_or_default().trim();
        let entry_point = match parts.next().map(str::trim) {
            Some(entry_point) if !entry_point.is_empty() => entry_point,
            _ => self.default_entry_point.as_str(),
        };
        format!("{}{}{}", capability, self.delimiter, entry_point)
    }

    pub fn register_hook<H: Hook + 'static>(&mut self, name: &str, hook: H) -> &mut Self {
        let key = self.resolve_name(name);
        self.hooks.insert(key, Arc::new(hook));
        self
    }

    pub fn register_hook_fn<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&FunctionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_hook(name, FnHook(f))
    }

    pub fn register_predicate<P: Predicate + 'static>(&mut self, name: &str, predicate: P) -> &mut Self {
        let key = self.resolve_name(name);
        self.predicates.insert(key, Arc::new(predicate));
        self
    }

    pub fn register_predicate_fn<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&FunctionContext) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.register_predicate(name, FnPredicate(f))
    }

    pub fn hook(&self, name: &str) -> Result<Arc<dyn Hook>> {
        self.hooks
            .get(&self.resolve_name(name))
            .cloned()
            .ok_or_else(|| WorkflowError::FunctionNotFound { name: name.to_string() })
    }

    pub fn predicate(&self, name: &str) -> Result<Arc<dyn Predicate>> {
        self.predicates
            .get(&self.resolve_name(name))
            .cloned()
            .ok_or_else(|| WorkflowError::FunctionNotFound { name: name.to_string() })
    }

    pub fn is_registered(&self, name: &str) -> bool {
        let key = self.resolve_name(name);
        self.hooks.contains_key(&key) || self.predicates.contains_key(&key)
    }

    /// Names of every registration, sorted
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.keys().chain(self.predicates.keys()).cloned().collect();
        names.sort();
        names.dedup();
        names
    }

    /// Run a hook list in order, stopping at the first failure
    ///
    /// An empty list is a no-op.
    pub async fn run_hooks(&self, functions: &[FunctionRef], base: &FunctionContext) -> Result<()> {
        for function in functions {
            let hook = self.hook(&function.name)?;
            debug!(function = %function.name, "running hook");
            hook.call(&base.with_args(&function.args))
                .await
                .map_err(|e| WorkflowError::Hook {
                    name: function.name.clone(),
                    message: format!("{:#}", e),
                })?;
        }
        Ok(())
    }

    /// Evaluate one condition leaf
    pub async fn check(&self, function: &FunctionRef, base: &FunctionContext) -> Result<bool> {
        let predicate = self.predicate(&function.name)?;
        let passed = predicate
            .check(&base.with_args(&function.args))
            .await
            .map_err(|e| WorkflowError::Hook {
                name: function.name.clone(),
                message: format!("{:#}", e),
            })?;
        debug!(function = %function.name, passed, "checked condition");
        Ok(passed)
    }

    /// Ensure every function a definition mentions is registered
    pub fn verify_references(&self, contents: &DefinitionContents) -> Result<()> {
        match contents.function_refs().into_iter().find(|f| !self.is_registered(&f.name)) {
            Some(missing) => Err(WorkflowError::FunctionNotFound { name: missing.name.clone() }),
            None => Ok(()),
        }
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> FunctionContext {
        let mut entry = Entry::new("wf-1", Utc::now());
        entry.set_property("assignee", json!("alice"), Utc::now());
        let mut inputs = Map::new();
        inputs.insert("comment".to_string(), json!("looks good"));
        inputs.insert("caller".to_string(), json!("bob"));
        FunctionContext::new(&entry, &inputs)
    }

    #[test]
    fn test_resolve_name_defaults_entry_point() {
        let registry = FunctionRegistry::new();
        assert_eq!(registry.resolve_name("IsAssignee"), "IsAssignee@handle");
        assert_eq!(registry.resolve_name("IsAssignee@"), "IsAssignee@handle");
        assert_eq!(registry.resolve_name("Notice@send"), "Notice@send");
    }

    #[test]
    fn test_custom_delimiter() {
        let config = EngineConfig {
            function_delimiter: "::".to_string(),
            default_entry_point: "run".to_string(),
            ..EngineConfig::default()
        };
        let registry = FunctionRegistry::with_config(&config);
        assert_eq!(registry.resolve_name("Notice"), "Notice::run");
        assert_eq!(registry.resolve_name("Notice::send"), "Notice::send");
        assert!(registry.uses_naming_of(&config));
        assert!(!registry.uses_naming_of(&EngineConfig::default()));
        assert!(FunctionRegistry::new().uses_naming_of(&EngineConfig::default()));
    }

    #[test]
    fn test_context_merge_order() {
        let base = context();
        assert_eq!(base.input("comment"), Some(&json!("looks good")));
        assert_eq!(base.property("assignee"), Some(&json!("alice")));
        assert_eq!(base.get("state"), Some(&json!("CREATED")));
        assert!(base.entry_id().is_some());

        let mut args = Map::new();
        args.insert("state".to_string(), json!("overridden"));
        args.insert("template".to_string(), json!("resolved"));
        let merged = base.with_args(&args);
        assert_eq!(merged.get("state"), Some(&json!("overridden")));
        assert_eq!(merged.get("template"), Some(&json!("resolved")));
        assert_eq!(base.get("state"), Some(&json!("CREATED")));
    }

    #[tokio::test]
    async fn test_run_hooks_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = FunctionRegistry::new();
        let counter = calls.clone();
        registry.register_hook_fn("Audit@record", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let hooks = vec![FunctionRef::new("Audit@record"), FunctionRef::new("Audit@record")];
        registry.run_hooks(&hooks, &context()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        registry.run_hooks(&[], &context()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_function_is_not_found() {
        let registry = FunctionRegistry::new();
        let err = registry
            .run_hooks(&[FunctionRef::new("Missing@call")], &context())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::FunctionNotFound { ref name } if name == "Missing@call"));

        let err = registry.check(&FunctionRef::new("Missing"), &context()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::FunctionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_hooks_and_predicates_are_separate() {
        let mut registry = FunctionRegistry::new();
        registry.register_hook_fn("Notice@send", |_| Ok(()));
        let err = registry.check(&FunctionRef::new("Notice@send"), &context()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::FunctionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_predicate_sees_args_and_inputs() {
        let mut registry = FunctionRegistry::new();
        registry.register_predicate_fn("InputEquals", |ctx| {
            let key = ctx.get("key").and_then(|k| k.as_str()).unwrap_or_default();
            Ok(ctx.input(key) == ctx.get("value"))
        });

        let passing = FunctionRef::new("InputEquals")
            .with_arg("key", json!("caller"))
            .with_arg("value", json!("bob"));
        let failing = FunctionRef::new("InputEquals@handle")
            .with_arg("key", json!("caller"))
            .with_arg("value", json!("carol"));

        assert!(registry.check(&passing, &context()).await.unwrap());
        assert!(!registry.check(&failing, &context()).await.unwrap());
    }

    #[tokio::test]
    async fn test_hook_error_is_wrapped() {
        let mut registry = FunctionRegistry::new();
        registry.register_hook_fn("Mailer@send", |_| Err(anyhow::anyhow!("smtp unavailable")));

        let err = registry
            .run_hooks(&[FunctionRef::new("Mailer@send")], &context())
            .await
            .unwrap_err();
        match err {
            WorkflowError::Hook { name, message } => {
                assert_eq!(name, "Mailer@send");
                assert!(message.contains("smtp unavailable"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_verify_references() {
        let mut contents = DefinitionContents::default();
        contents.steps.push(crate::models::StepDescriptor::new(1, "Open", vec![]));
        contents.steps[0].pre_functions.push(FunctionRef::new("Notice@send"));

        let mut registry = FunctionRegistry::new();
        assert!(registry.verify_references(&contents).is_err());

        registry.register_hook_fn("Notice@send", |_| Ok(()));
        assert!(registry.verify_references(&contents).is_ok());
        assert_eq!(registry.list_names(), vec!["Notice@send".to_string()]);
    }
}
