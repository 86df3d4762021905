// Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use actionflow::{
    CurrentStep, Entry, FunctionRegistry, HistoryStep, InMemoryStorage, StepCommit, WorkflowDefinition,
    WorkflowEngine, WorkflowStorage,
};
use serde_json::json;
use uuid::Uuid;

/// Review workflow: one step fans out to three reviewers that meet at a join
///
/// - action 1 splits into steps 2, 3 and 4
/// - actions 10, 11 and 12 lead each reviewer step into the `gate` join
/// - action 2 is a plain move to step 2, traced at every hook point
/// - action 3 picks among conditioned and unconditioned results
/// - action 8 has no result that can qualify
/// - action 9 has a failing pre-function
pub fn review_definition(id: &str, join_passes: bool, barrier: bool) -> WorkflowDefinition {
    let join_condition = if join_passes { "Pass" } else { "Fail" };
    serde_json::from_value(json!({
        "id": id,
        "name": format!("Review {}", id),
        "contents": {
            "initial_actions": [
                {"id": 0, "name": "create", "results": [{"step": 1, "status": "Underway"}]}
            ],
            "steps": [
                {"id": 1, "name": "Open",
                 "post_functions": [{"name": "Trace", "args": {"label": "step.post"}}],
                 "actions": [
                    {"id": 1, "name": "Review", "screen": "review_screen",
                     "results": [{"split": "reviewers", "old_status": "Finished"}]},
                    {"id": 2, "name": "Start",
                     "pre_functions": [{"name": "Trace", "args": {"label": "action.pre"}}],
                     "post_functions": [{"name": "Trace@handle", "args": {"label": "action.post"}}],
                     "results": [{"step": 2, "status": "Underway",
                                  "pre_functions": [{"name": "Trace", "args": {"label": "result.pre"}}],
                                  "post_functions": [{"name": "Trace", "args": {"label": "result.post"}}]}]},
                    {"id": 3, "name": "Decide",
                     "results": [
                        {"conditions": {"list": [{"name": "Fail"}]}, "step": 2, "status": "Rejected"},
                        {"step": 5, "status": "Fallback"},
                        {"conditions": {"type": "or", "list": [{"name": "Fail"}, {"name": "Pass"}]},
                         "step": 6, "status": "Chosen"}
                     ]},
                    {"id": 8, "name": "Dead End",
                     "results": [{"conditions": {"list": [{"name": "Fail"}]}, "step": 2, "status": "Never"}]},
                    {"id": 9, "name": "Explode",
                     "pre_functions": [{"name": "Boom"}],
                     "results": [{"step": 2, "status": "Underway"}]}
                 ]},
                {"id": 2, "name": "Legal",
                 "pre_functions": [{"name": "Trace", "args": {"label": "next.pre"}}],
                 "actions": [
                    {"id": 10, "name": "Approve", "results": [{"join": "gate", "old_status": "Approved"}]}
                 ]},
                {"id": 3, "name": "Finance", "actions": [
                    {"id": 11, "name": "Approve", "results": [{"join": "gate", "old_status": "Approved"}]}
                ]},
                {"id": 4, "name": "Security", "actions": [
                    {"id": 12, "name": "Approve", "results": [{"join": "gate", "old_status": "Approved"}]}
                ]},
                {"id": 5, "name": "Fallback"},
                {"id": 6, "name": "Chosen"},
                {"id": 7, "name": "Merged"}
            ],
            "splits": [
                {"id": "reviewers", "list": [
                    {"step": 2, "status": "Pending"},
                    {"step": 3, "status": "Pending"},
                    {"step": 4, "status": "Pending", "owners": ["sec-team"]}
                ]}
            ],
            "joins": [
                {"id": "gate", "conditions": {"list": [{"name": join_condition}]},
                 "step": 7, "status": "Merged", "barrier": barrier}
            ]
        }
    }))
    .expect("review definition is valid JSON")
}

/// Registry with the functions the review workflow references
///
/// `Trace` appends its `label` arg to the returned log.
pub fn registry() -> (FunctionRegistry, Arc<Mutex<Vec<String>>>) {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let log = trace.clone();

    let mut registry = FunctionRegistry::new();
    registry
        .register_predicate_fn("Pass", |_| Ok(true))
        .register_predicate_fn("Fail", |_| Ok(false))
        .register_hook_fn("Trace", move |ctx| {
            if let Some(label) = ctx.get("label").and_then(|l| l.as_str()) {
                log.lock().unwrap().push(label.to_string());
            }
            Ok(())
        })
        .register_hook_fn("Boom", |_| Err(anyhow::anyhow!("exploded")));
    (registry, trace)
}

pub struct Fixture {
    pub engine: Arc<WorkflowEngine>,
    pub storage: Arc<CountingStorage>,
    pub trace: Arc<Mutex<Vec<String>>>,
}

pub async fn fixture() -> Fixture {
    let (registry, trace) = registry();
    let storage = Arc::new(CountingStorage::default());
    let engine = WorkflowEngine::new(storage.clone(), Arc::new(registry));
    engine.save_definition(review_definition("review", false, false)).await.unwrap();
    engine.save_definition(review_definition("review-open", true, false)).await.unwrap();
    engine.save_definition(review_definition("review-barrier", true, true)).await.unwrap();
    Fixture {
        engine: Arc::new(engine),
        storage,
        trace,
    }
}

impl Fixture {
    /// Create and initialize an entry of the given definition
    pub async fn started(&self, definition_id: &str) -> Entry {
        let entry = self.engine.create_instance(definition_id).await.unwrap();
        self.engine.initialize(entry.id).await.unwrap();
        self.engine.get_entry(entry.id).await.unwrap()
    }
}

/// In-memory storage that counts every write
#[derive(Default)]
pub struct CountingStorage {
    inner: InMemoryStorage,
    writes: AtomicUsize,
}

impl CountingStorage {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl WorkflowStorage for CountingStorage {
    async fn save_definition(&self, definition: WorkflowDefinition) -> actionflow::Result<WorkflowDefinition> {
        self.wrote();
        self.inner.save_definition(definition).await
    }

    async fn get_definition(&self, id: &str) -> actionflow::Result<Option<WorkflowDefinition>> {
        self.inner.get_definition(id).await
    }

    async fn list_definitions(&self) -> actionflow::Result<Vec<WorkflowDefinition>> {
        self.inner.list_definitions().await
    }

    async fn delete_definition(&self, id: &str) -> actionflow::Result<()> {
        self.wrote();
        self.inner.delete_definition(id).await
    }

    async fn create_entry(&self, entry: Entry) -> actionflow::Result<Entry> {
        self.wrote();
        self.inner.create_entry(entry).await
    }

    async fn get_entry(&self, id: &Uuid) -> actionflow::Result<Option<Entry>> {
        self.inner.get_entry(id).await
    }

    async fn update_entry(&self, entry: Entry) -> actionflow::Result<Entry> {
        self.wrote();
        self.inner.update_entry(entry).await
    }

    async fn list_current_steps(&self, entry_id: &Uuid) -> actionflow::Result<Vec<CurrentStep>> {
        self.inner.list_current_steps(entry_id).await
    }

    async fn list_history_steps(&self, entry_id: &Uuid) -> actionflow::Result<Vec<HistoryStep>> {
        self.inner.list_history_steps(entry_id).await
    }

    async fn commit_steps(&self, commit: StepCommit) -> actionflow::Result<()> {
        self.wrote();
        self.inner.commit_steps(commit).await
    }
}
