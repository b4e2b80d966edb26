use crate::error::EngineError;
use crate::types::{JobDefinition, JobId, JobName, JobSpec, WorkflowDefinition, WorkflowId};
use petgraph::graph::DiGraph;
use std::collections::HashMap;

/// Build the canonical job set for a workflow from a flat batch of job specs.
///
/// Each job's `depends_count` is the number of entries across all *other*
/// jobs' `next_job_names` lists that name it. The batch is validated up
/// front: duplicate names, references to jobs outside the batch, and cyclic
/// dependency graphs are all rejected as definition errors, so a run built
/// from the result always has at least the structural chance to drain.
///
/// Pure function of the input batch; no side effects.
pub fn build_jobs(
    workflow_id: WorkflowId,
    specs: &[JobSpec],
) -> Result<Vec<JobDefinition>, EngineError> {
    // Seed counters and detect duplicate names in one pass
    let mut depends_count: HashMap<&JobName, u32> = HashMap::with_capacity(specs.len());
    for spec in specs {
        if depends_count.insert(&spec.name, 0).is_some() {
            return Err(EngineError::definition(format!(
                "duplicate job name '{}'",
                spec.name
            )));
        }
    }

    // Every next-job reference increments its target's in-degree
    for spec in specs {
        for next in &spec.next_job_names {
            match depends_count.get_mut(next) {
                Some(count) => *count += 1,
                None => {
                    return Err(EngineError::definition(format!(
                        "job '{}' lists unknown dependent '{}'",
                        spec.name, next
                    )))
                }
            }
        }
    }

    validate_acyclic(specs)?;

    Ok(specs
        .iter()
        .map(|spec| JobDefinition {
            id: JobId::new(),
            workflow_id,
            name: spec.name.clone(),
            image: spec.image.clone(),
            parameters: spec.parameters.clone(),
            next_job_names: spec.next_job_names.clone(),
            depends_count: depends_count[&spec.name],
        })
        .collect())
}

/// Build a full workflow definition from its job batch
pub fn build_workflow(
    name: impl Into<String>,
    description: impl Into<String>,
    specs: &[JobSpec],
) -> Result<WorkflowDefinition, EngineError> {
    let id = WorkflowId::new();
    let jobs = build_jobs(id, specs)?;

    Ok(WorkflowDefinition {
        id,
        name: name.into(),
        description: description.into(),
        jobs,
        created_at: chrono::Utc::now(),
    })
}

/// Reject batches whose dependency graph contains a cycle. A cycle would
/// leave every job on it waiting forever, so it is caught at definition time
/// rather than surfacing later as a stuck run.
fn validate_acyclic(specs: &[JobSpec]) -> Result<(), EngineError> {
    let mut graph = DiGraph::<&JobName, ()>::new();
    let mut indices = HashMap::with_capacity(specs.len());

    for spec in specs {
        let node = graph.add_node(&spec.name);
        indices.insert(&spec.name, node);
    }

    for spec in specs {
        for next in &spec.next_job_names {
            // References were resolved by the caller
            graph.add_edge(indices[&spec.name], indices[next], ());
        }
    }

    if petgraph::algo::is_cyclic_directed(&graph) {
        return Err(EngineError::definition(
            "workflow contains circular dependencies",
        ));
    }

    Ok(())
}
