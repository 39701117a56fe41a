//! Command handlers and the simulated operations the cluster runs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::info;

use docket_core::app::{AppBuilder, Cluster, DocketConfig};
use docket_core::conflict::OperationMatrix;
use docket_core::coordinator::wait_for_task;
use docket_core::domain::{
    CallName, CallReport, CallRequest, CallState, ExecutionError, ResourceMap, ResourceOperation,
    Response, TaskEnvelope, TaskId, TaskResult,
};
use docket_core::dispatch::OperationHandler;

/// Sleeps for `kwargs.duration_ms` (default 200) and echoes its arguments.
/// `kwargs.fail = true` makes it fail instead.
struct SimulatedOperation;

#[async_trait]
impl OperationHandler for SimulatedOperation {
    async fn handle(&self, call: &TaskEnvelope) -> Result<TaskResult, ExecutionError> {
        let millis = call
            .kwargs
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(200);
        tokio::time::sleep(Duration::from_millis(millis)).await;

        if call.kwargs.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(ExecutionError::new(
                "simulated_failure",
                format!("{} failed on request", call.call_name),
            ));
        }
        Ok(TaskResult::value(json!({
            "call_name": call.call_name,
            "args": call.args,
        })))
    }
}

pub fn load_config(path: Option<&Path>) -> Result<DocketConfig> {
    let Some(path) = path else {
        return Ok(DocketConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: DocketConfig =
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn start_cluster(config: DocketConfig) -> Result<Cluster> {
    let mut builder = AppBuilder::new().config(config);
    for call_name in CallName::ALL {
        builder = builder.register(call_name, Arc::new(SimulatedOperation))?;
    }
    let app = builder.expect_operations(&CallName::ALL).build()?;
    Ok(app.start().await?)
}

async fn settle(
    cluster: &Cluster,
    task_ids: &[TaskId],
    poll_interval: Duration,
    timeout: Duration,
) -> Result<Vec<CallReport>> {
    let (_tx, rx) = watch::channel(false);
    let mut reports = Vec::with_capacity(task_ids.len());
    for task_id in task_ids {
        let report = wait_for_task(
            cluster.store(),
            *task_id,
            &CallState::COMPLETE,
            poll_interval,
            Some(timeout),
            rx.clone(),
        )
        .await?;
        reports.push(report);
    }
    Ok(reports)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn handle_matrix() -> Result<()> {
    let matrix = OperationMatrix::standard();
    print!("{:<10}", "held\\new");
    for proposed in ResourceOperation::ALL {
        print!("{:<10}", proposed.as_str());
    }
    println!();
    for held in ResourceOperation::ALL {
        print!("{:<10}", held.as_str());
        for proposed in ResourceOperation::ALL {
            print!("{:<10}", matrix.response(held, proposed).as_str());
        }
        println!();
    }
    Ok(())
}

pub async fn handle_demo(config: DocketConfig) -> Result<()> {
    let poll = config.task_state_poll_interval();
    let cluster = start_cluster(config).await?;
    let coordinator = cluster.coordinator().clone();

    let sync = coordinator
        .call_request(CallName::RepoSync)
        .with_arg(json!("repo-1"))
        .with_kwarg("duration_ms", json!(500))
        .syncs_resource("repository", "repo-1")
        .with_tag("repository:repo-1");
    let publish = coordinator
        .call_request(CallName::RepoPublish)
        .with_arg(json!("repo-1"))
        .publishes_resource("repository", "repo-1")
        .with_tag("repository:repo-1");
    let delete = coordinator
        .call_request(CallName::RepoDelete)
        .with_arg(json!("repo-1"))
        .deletes_resource("repository", "repo-1");

    let mut submitted = Vec::new();
    for request in [sync, publish, delete] {
        let report = coordinator.execute_call_asynchronously(request).await?;
        info!(task_id = %report.task_id, response = ?report.response, "demo call submitted");
        print_json(&report)?;
        if report.response != Some(Response::Rejected) {
            submitted.push(report.task_id);
        }
    }

    let create = coordinator
        .call_request(CallName::RepoCreate)
        .creates_resource("repository", "repo-2");
    let upload = coordinator
        .call_request(CallName::ContentUpload)
        .updates_resource("repository", "repo-2")
        .depends_on(create.id);
    let group = coordinator
        .execute_multiple_calls(vec![upload, create])
        .await?;
    submitted.extend(group.iter().map(|r| r.task_id));

    let reports = settle(&cluster, &submitted, poll, Duration::from_secs(30)).await?;
    print_json(&reports)?;
    cluster.shutdown_and_join().await;
    Ok(())
}

/// One call in a `run --requests` file. `depends_on` holds indices into
/// the same file.
#[derive(Debug, Deserialize)]
struct RequestSpec {
    call_name: CallName,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: serde_json::Map<String, Value>,
    #[serde(default)]
    resources: ResourceMap,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    depends_on: Vec<usize>,
}

fn build_requests(cluster: &Cluster, specs: Vec<RequestSpec>) -> Result<Vec<CallRequest>> {
    let ids: Vec<TaskId> = specs
        .iter()
        .map(|spec| cluster.coordinator().call_request(spec.call_name).id)
        .collect();
    specs
        .into_iter()
        .zip(ids.iter().copied())
        .map(|(spec, id)| {
            let mut request = CallRequest::new(id, spec.call_name);
            request.args = spec.args;
            request.kwargs = spec.kwargs;
            request.resources = spec.resources;
            request.tags = spec.tags;
            for index in spec.depends_on {
                let Some(prerequisite) = ids.get(index) else {
                    bail!("depends_on index {index} is out of range");
                };
                request = request.depends_on(*prerequisite);
            }
            Ok(request)
        })
        .collect()
}

pub async fn handle_run(
    config: DocketConfig,
    requests: &Path,
    group: bool,
    timeout: Duration,
) -> Result<()> {
    let text = std::fs::read_to_string(requests)
        .with_context(|| format!("reading {}", requests.display()))?;
    let specs: Vec<RequestSpec> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", requests.display()))?;

    let poll = config.task_state_poll_interval();
    let cluster = start_cluster(config).await?;
    let requests = build_requests(&cluster, specs)?;

    let admitted = if group {
        cluster
            .coordinator()
            .execute_multiple_calls(requests)
            .await?
    } else {
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            reports.push(cluster.coordinator().execute_call_asynchronously(request).await?);
        }
        reports
    };

    let (rejected, accepted): (Vec<CallReport>, Vec<CallReport>) = admitted
        .into_iter()
        .partition(|r| r.response == Some(Response::Rejected));
    let task_ids: Vec<TaskId> = accepted.iter().map(|r| r.task_id).collect();

    let outcome = tokio::select! {
        reports = settle(&cluster, &task_ids, poll, timeout) => reports,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; cancelling outstanding calls");
            for task_id in &task_ids {
                cluster.coordinator().cancel_call(*task_id).await?;
            }
            Ok(Vec::new())
        }
    };

    let mut reports = rejected;
    reports.extend(outcome?);
    print_json(&reports)?;
    cluster.shutdown_and_join().await;
    Ok(())
}
