//! Pipeline Engine
//!
//! Orders stages by their declared successors starting at the entry stage and
//! runs them one at a time. Before each stage the context is projected down
//! to the stage's declared inputs; afterwards only its declared outputs are
//! merged back.
//!
//! ```text
//! initial fields → [stage A] → merge → [stage B] → merge → ... → PipelineRun
//!                   ↑ inputs            ↑ inputs
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, StageError};
use crate::result::{ExecutionState, PipelineRun, ProcessingStats};
use crate::stage::{FieldMap, Stage};

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    entry: Option<String>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage (chainable). The first stage is the entry unless
    /// [`PipelineBuilder::entry`] says otherwise.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn entry(mut self, stage_id: impl Into<String>) -> Self {
        self.entry = Some(stage_id.into());
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let first = self.stages.first().ok_or(PipelineError::NoStages)?;
        let entry = self
            .entry
            .unwrap_or_else(|| first.descriptor().id.clone());

        let mut by_id: HashMap<String, Arc<dyn Stage>> = HashMap::new();
        let mut declared = Vec::new();
        for stage in &self.stages {
            let descriptor = stage.descriptor();
            validate_fields(descriptor)?;
            if by_id
                .insert(descriptor.id.clone(), Arc::clone(stage))
                .is_some()
            {
                return Err(PipelineError::DuplicateStage(descriptor.id.clone()));
            }
            declared.push(descriptor.id.clone());
        }

        if !by_id.contains_key(&entry) {
            return Err(PipelineError::MissingEntry(entry));
        }
        for stage in &self.stages {
            let descriptor = stage.descriptor();
            if let Some(next) = descriptor.next.iter().find(|next| !by_id.contains_key(*next)) {
                return Err(PipelineError::UnknownSuccessor {
                    stage: descriptor.id.clone(),
                    next: next.clone(),
                });
            }
        }

        let order = execution_order(&entry, &by_id, &declared)?;
        let unreachable: Vec<&String> = declared.iter().filter(|id| !order.contains(*id)).collect();
        if !unreachable.is_empty() {
            tracing::warn!(?unreachable, entry = %entry, "Pipeline: stages not reachable from entry");
        }

        Ok(Pipeline {
            stages: by_id,
            order,
        })
    }
}

fn validate_fields(descriptor: &crate::stage::StageDescriptor) -> Result<(), PipelineError> {
    let invalid = |reason: String| PipelineError::InvalidFields {
        stage: descriptor.id.clone(),
        reason,
    };
    if descriptor.id.trim().is_empty() {
        return Err(invalid("stage id cannot be empty".to_string()));
    }
    if let Some(field) = descriptor
        .inputs
        .iter()
        .find(|field| descriptor.optional_inputs.contains(*field))
    {
        return Err(invalid(format!("'{field}' is both required and optional")));
    }
    if let Some(local) = descriptor.rename.keys().find(|local| {
        !descriptor.inputs.contains(*local)
            && !descriptor.optional_inputs.contains(*local)
            && !descriptor.outputs.contains(*local)
    }) {
        return Err(invalid(format!("rename of undeclared field '{local}'")));
    }
    Ok(())
}

// Kahn's algorithm over the stages reachable from `entry`; ties follow
// registration order.
fn execution_order(
    entry: &str,
    stages: &HashMap<String, Arc<dyn Stage>>,
    declared: &[String],
) -> Result<Vec<String>, PipelineError> {
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::from([entry.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id.clone()) {
            continue;
        }
        if let Some(stage) = stages.get(&id) {
            queue.extend(stage.descriptor().next.iter().cloned());
        }
    }

    let mut in_degree: HashMap<&str, usize> = declared
        .iter()
        .filter(|id| reachable.contains(*id))
        .map(|id| (id.as_str(), 0))
        .collect();
    for id in declared.iter().filter(|id| reachable.contains(*id)) {
        for next in &stages[id].descriptor().next {
            if let Some(degree) = in_degree.get_mut(next.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut order = Vec::with_capacity(in_degree.len());
    let mut done = HashSet::new();
    while order.len() < in_degree.len() {
        let ready = declared
            .iter()
            .find(|id| in_degree.get(id.as_str()) == Some(&0) && !done.contains(*id));
        let Some(id) = ready else {
            let stuck = declared
                .iter()
                .find(|id| reachable.contains(*id) && !done.contains(*id))
                .cloned()
                .unwrap_or_else(|| entry.to_string());
            return Err(PipelineError::Cycle(stuck));
        };
        done.insert(id.clone());
        order.push(id.clone());
        for next in &stages[id].descriptor().next {
            if let Some(degree) = in_degree.get_mut(next.as_str()) {
                *degree = degree.saturating_sub(1);
            }
        }
    }
    Ok(order)
}

/// A validated, immutable stage graph.
pub struct Pipeline {
    stages: HashMap<String, Arc<dyn Stage>>,
    order: Vec<String>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Stage ids in execution order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Run the stages over a fresh context seeded with `initial`.
    ///
    /// Cancellation is checked before each stage, never mid-stage.
    pub async fn execute(&self, initial: FieldMap, cancel: &CancellationToken) -> PipelineRun {
        let mut run = PipelineRun {
            state: ExecutionState::Pending,
            transitions: vec![ExecutionState::Pending],
            context: initial,
            error: None,
            stats: ProcessingStats::default(),
        };

        for stage_id in &self.order {
            if cancel.is_cancelled() {
                tracing::info!(stage = %stage_id, "Pipeline: cancelled before stage");
                transition(&mut run, ExecutionState::Cancelled(stage_id.clone()));
                return run;
            }
            let Some(stage) = self.stages.get(stage_id) else {
                continue;
            };
            transition(&mut run, ExecutionState::Running(stage_id.clone()));

            let started = Instant::now();
            let result = match project(stage.as_ref(), &run.context) {
                Ok(input) => stage.transform(input).await,
                Err(error) => Err(error),
            };
            let duration_ms = started.elapsed().as_millis() as u64;
            run.stats.record_stage(stage_id.clone(), duration_ms);

            match result {
                Ok(output) => {
                    merge(stage.as_ref(), output, &mut run.context);
                    tracing::debug!(stage = %stage_id, duration_ms, "Pipeline: stage completed");
                }
                Err(error) => {
                    tracing::warn!(stage = %stage_id, error = %error, "Pipeline: stage failed");
                    run.error = Some(error);
                    transition(&mut run, ExecutionState::Failed(stage_id.clone()));
                    return run;
                }
            }
        }

        transition(&mut run, ExecutionState::Completed);
        run
    }
}

fn transition(run: &mut PipelineRun, state: ExecutionState) {
    run.transitions.push(state.clone());
    run.state = state;
}

/// The stage's view of the context: declared inputs only, under local names.
fn project(stage: &dyn Stage, context: &FieldMap) -> Result<FieldMap, StageError> {
    let descriptor = stage.descriptor();
    let mut input = FieldMap::new();
    for local in &descriptor.inputs {
        let value = context
            .get(descriptor.context_field(local))
            .ok_or_else(|| StageError::MissingInput(descriptor.context_field(local).to_string()))?;
        input.insert(local.clone(), value.clone());
    }
    for local in &descriptor.optional_inputs {
        if let Some(value) = context.get(descriptor.context_field(local)) {
            input.insert(local.clone(), value.clone());
        }
    }
    Ok(input)
}

fn merge(stage: &dyn Stage, mut output: FieldMap, context: &mut FieldMap) {
    let descriptor = stage.descriptor();
    for local in &descriptor.outputs {
        if let Some(value) = output.remove(local) {
            context.insert(descriptor.context_field(local).to_string(), value);
        }
    }
    if !output.is_empty() {
        let dropped: Vec<&String> = output.keys().collect();
        tracing::debug!(stage = %descriptor.id, ?dropped, "Pipeline: dropped undeclared outputs");
    }
}
