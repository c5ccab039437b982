//! JSON workflow plans and the trees built from them

use anyhow::{bail, Result};
use arborcore::{FieldPolicy, FlowError, ObservedField, ObservedState, Value};
use arborruntime::{
    ErrorMergeStrategy, ExecutionContext, ReflectionConfig, ReflectionManager, StepOptions,
    TaskOptions, Workflow,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub children: Vec<PlanSpec>,
    /// Run children together instead of one after another
    #[serde(default)]
    pub concurrent: bool,
    #[serde(default)]
    pub merge_errors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_merge_depth: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<ReflectionConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<StateFieldSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub delay_ms: u64,
    /// Fail this many times before succeeding
    #[serde(default)]
    pub fail_times: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub snapshot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFieldSpec {
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub policy: FieldPolicy,
}

impl PlanSpec {
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: PlanSpec = serde_json::from_str(json)?;
        plan.check()?;
        Ok(plan)
    }

    /// Total workflows in the plan
    pub fn workflow_count(&self) -> usize {
        1 + self.children.iter().map(PlanSpec::workflow_count).sum::<usize>()
    }

    fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("workflow names must not be empty");
        }
        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                bail!("workflow '{}' has duplicate step '{}'", self.name, step.name);
            }
        }
        self.children.iter().try_for_each(PlanSpec::check)
    }

    /// Build the workflow tree described by this plan
    pub fn build(&self) -> Result<Workflow, FlowError> {
        let state = Arc::new(PlanState::new(&self.state));
        let steps: Arc<Vec<PlanStep>> = Arc::new(self.steps.iter().cloned().map(PlanStep::new).collect());

        let mut children = Vec::with_capacity(self.children.len());
        for spec in &self.children {
            children.push(spec.build()?);
        }
        let children = Arc::new(children);
        let task = self.task_options();

        let executor_state = state.clone();
        let executor_children = children.clone();
        let workflow = Workflow::new(self.name.clone())
            .with_state(state)
            .with_executor(move |ctx: ExecutionContext| {
                let steps = steps.clone();
                let children = executor_children.clone();
                let state = executor_state.clone();
                let task = task.clone();
                async move { run_plan(ctx, &steps, &children, &state, task).await }
            });

        if let Some(config) = &self.reflection {
            workflow.set_reflection(Arc::new(ReflectionManager::new(config.clone())));
        }
        for child in children.iter() {
            workflow.attach_child(child)?;
        }

        Ok(workflow)
    }

    fn task_options(&self) -> TaskOptions {
        let mut options = TaskOptions::new(format!("{}:children", self.name));
        if self.concurrent {
            options = options.concurrent();
        }
        if self.merge_errors {
            let mut strategy = ErrorMergeStrategy::concatenate();
            if let Some(depth) = self.max_merge_depth {
                strategy = strategy.with_max_merge_depth(depth);
            }
            options = options.with_merge(strategy);
        }
        options
    }

    /// Plan written by `arbor init`
    pub fn example() -> Self {
        let step = |name: &str, delay_ms: u64| StepSpec {
            name: name.to_string(),
            delay_ms,
            fail_times: 0,
            error: None,
            snapshot: false,
            timeout_ms: None,
        };

        PlanSpec {
            name: "research".to_string(),
            steps: vec![StepSpec {
                snapshot: true,
                ..step("plan", 50)
            }],
            children: vec![
                PlanSpec {
                    name: "search".to_string(),
                    steps: vec![StepSpec {
                        fail_times: 1,
                        error: Some("response failed schema validation".to_string()),
                        ..step("query", 100)
                    }],
                    reflection: Some(ReflectionConfig::enabled(3)),
                    ..PlanSpec::leaf()
                },
                PlanSpec {
                    name: "summarize".to_string(),
                    steps: vec![step("draft", 80), step("review", 40)],
                    ..PlanSpec::leaf()
                },
            ],
            concurrent: true,
            merge_errors: true,
            max_merge_depth: None,
            reflection: None,
            state: vec![
                StateFieldSpec {
                    name: "topic".to_string(),
                    value: serde_json::json!("workflow trees"),
                    policy: FieldPolicy::Visible,
                },
                StateFieldSpec {
                    name: "api_key".to_string(),
                    value: serde_json::json!("sk-example"),
                    policy: FieldPolicy::Redact,
                },
            ],
        }
    }

    fn leaf() -> Self {
        PlanSpec {
            name: String::new(),
            steps: Vec::new(),
            children: Vec::new(),
            concurrent: false,
            merge_errors: false,
            max_merge_depth: None,
            reflection: None,
            state: Vec::new(),
        }
    }
}

async fn run_plan(
    ctx: ExecutionContext,
    steps: &[PlanStep],
    children: &[Workflow],
    state: &PlanState,
    task: TaskOptions,
) -> arborcore::Result<Value> {
    let mut outputs = Vec::with_capacity(steps.len() + 1);

    for (index, step) in steps.iter().enumerate() {
        let mut options = StepOptions::new(step.spec.name.clone());
        if step.spec.snapshot {
            options = options.with_snapshot();
        }
        if let Some(ms) = step.spec.timeout_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }

        let output = ctx.step_with(options, || step.execute()).await?;
        state.step_completed();
        ctx.progress(index as u64 + 1, steps.len() as u64, format!("Finished '{}'", step.spec.name));
        outputs.push(output);
    }

    if !children.is_empty() {
        let children = children.to_vec();
        let values = ctx.task(task, || async move { Ok(children) }).await?;
        outputs.push(Value::Array(values));
    }

    Ok(Value::Array(outputs))
}

struct PlanStep {
    spec: StepSpec,
    failures: AtomicU32,
}

impl PlanStep {
    fn new(spec: StepSpec) -> Self {
        Self {
            spec,
            failures: AtomicU32::new(0),
        }
    }

    async fn execute(&self) -> arborcore::Result<Value> {
        if self.spec.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.spec.delay_ms)).await;
        }

        if self.failures.fetch_add(1, Ordering::SeqCst) < self.spec.fail_times {
            let message = self
                .spec
                .error
                .clone()
                .unwrap_or_else(|| format!("step '{}' failed", self.spec.name));
            return Err(FlowError::Execution(message));
        }

        Ok(Value::from(self.spec.name.as_str()))
    }
}

/// Observed state of a plan workflow: its declared fields plus progress
struct PlanState {
    fields: Vec<StateFieldSpec>,
    steps_completed: AtomicU64,
}

impl PlanState {
    fn new(fields: &[StateFieldSpec]) -> Self {
        Self {
            fields: fields.to_vec(),
            steps_completed: AtomicU64::new(0),
        }
    }

    fn step_completed(&self) {
        self.steps_completed.fetch_add(1, Ordering::SeqCst);
    }
}

impl ObservedState for PlanState {
    fn observed_fields(&self) -> Vec<ObservedField> {
        let mut fields: Vec<ObservedField> = self
            .fields
            .iter()
            .map(|field| ObservedField {
                name: field.name.clone(),
                value: Value::from(field.value.clone()),
                policy: field.policy,
            })
            .collect();
        fields.push(ObservedField::new(
            "steps_completed",
            self.steps_completed.load(Ordering::SeqCst),
        ));
        fields
    }
}
