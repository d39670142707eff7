//! Runs that suspend, survive a simulated process restart and finish.
//!
//! A "restart" drops every runtime object and boots a fresh runtime on
//! the same continuation store; only what was checkpointed carries over.

use flowcore::{
    AgentEnv, Branch, Construct, DefinitionMode, EnvMap, Expr, FlowError, FlowNode, FlowNodeKind, GraphListener,
    IdentityPolicy, IdentityProvider, RunId, RunStatus, StaticAgentProvider, StaticIdentityProvider, StepCall,
    Value,
};
use flownodes::{semaphore, standard_registry, SemaphoreBoard, SemaphoreStep};
use flowruntime::{
    ContinuationStore, ExecutionPhase, FileContinuationStore, FlowRuntime, InMemoryContinuationStore, RuntimeConfig,
    StepRegistry,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

fn env(pairs: &[(&str, &str)]) -> EnvMap {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn agent_env(pairs: &[(&str, Option<&str>)]) -> AgentEnv {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
        .collect()
}

/// What survives a restart: the store, the semaphore numbering and the
/// external configuration.
struct Host {
    board: Arc<SemaphoreBoard>,
    store: Arc<dyn ContinuationStore>,
    identity: Arc<dyn IdentityProvider>,
    config: RuntimeConfig,
}

impl Host {
    fn new() -> Self {
        Self::with_store(Arc::new(InMemoryContinuationStore::new()))
    }

    fn with_store(store: Arc<dyn ContinuationStore>) -> Self {
        let mut config = RuntimeConfig::default();
        config.ambient_env = env(&[("BUILD_TAG", "flow-demo-1"), ("K", "v0"), ("CONTROLLER_ONLY", "yes")]);
        Self {
            board: Arc::new(SemaphoreBoard::new()),
            store,
            identity: Arc::new(StaticIdentityProvider::new()),
            config,
        }
    }

    fn boot(&self) -> FlowRuntime {
        self.boot_with(standard_registry(&self.board))
    }

    fn boot_with(&self, registry: StepRegistry) -> FlowRuntime {
        let agents = StaticAgentProvider::default().with_agent(
            "linux",
            agent_env(&[
                ("PERMACHINE", Some("set")),
                ("BUILD_TAG", Some("agent-tag")),
                ("CONTROLLER_ONLY", None),
            ]),
        );
        FlowRuntime::builder()
            .config(self.config.clone())
            .registry(registry)
            .store(Arc::clone(&self.store))
            .identity_provider(Arc::clone(&self.identity))
            .agent_provider(Arc::new(agents))
            .build()
    }
}

/// Drop `runtime` and boot a fresh one that resumes everything.
async fn restart(host: &Host, runtime: FlowRuntime) -> FlowRuntime {
    drop(runtime);
    let runtime = host.boot();
    let report = runtime.resume_all().await.unwrap();
    assert!(report.failed.is_empty(), "resume failures: {:?}", report.failed);
    runtime
}

fn step(name: &str, args: &[(&str, Expr)]) -> Construct {
    let call = args
        .iter()
        .fold(StepCall::new(name), |call, (k, v)| call.with_arg(*k, v.clone()));
    Construct::Step(call)
}

fn echo(text: &str) -> Construct {
    step("echo", &[("message", Expr::template(text))])
}

fn semaphore_step(id: &str) -> Construct {
    step("semaphore", &[("id", Expr::lit(id))])
}

fn seq(items: Vec<Construct>) -> Construct {
    Construct::Sequence(items)
}

fn set_var(name: &str, value: Expr) -> Construct {
    Construct::SetVar {
        name: name.to_string(),
        value,
    }
}

fn set_env(key: &str, value: Expr) -> Construct {
    Construct::SetEnv {
        key: key.to_string(),
        value,
    }
}

fn retry(attempts: u32, body: Construct) -> Construct {
    Construct::Retry {
        attempts,
        body: Box::new(body),
    }
}

fn count_lines(runtime: &FlowRuntime, run: RunId, needle: &str) -> usize {
    runtime
        .execution(run)
        .map(|e| e.log().lines().iter().filter(|l| l.text.contains(needle)).count())
        .unwrap_or(0)
}

const DEMO: &str = r#"{
    "name": "demo",
    "body": {"sequence": [
        {"step": {"name": "echo", "args": {"message": {"lit": "before"}}}},
        {"step": {"name": "semaphore", "args": {"id": {"lit": "wait"}}}},
        {"step": {"name": "echo", "args": {"message": {"lit": "after"}}}}
    ]}
}"#;

#[tokio::test]
async fn semaphore_survives_restart_with_identical_history() {
    init_tracing();
    let host = Host::new();
    let runtime = host.boot();

    let execution = runtime.start(DEMO, DefinitionMode::Full, "demo").unwrap();
    let run = execution.run_id();
    assert_eq!(execution.wait_until_settled().await, ExecutionPhase::Suspended { pending: 1 });
    assert!(execution.log().contains("before"));
    assert!(!execution.log().contains("after"));
    let before = execution.graph().await;
    drop(execution);

    let runtime = restart(&host, runtime).await;
    let execution = runtime.execution(run).expect("run resumed");
    let after = execution.graph().await;
    assert_eq!(&after.nodes()[..before.len()], before.nodes());
    assert!(execution.log().contains("[wait/1] still waiting"));

    assert!(semaphore::release(&runtime, "wait/1", Value::Null));
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    assert!(execution.log().contains("after"));

    let graph = execution.graph().await;
    graph.verify().unwrap();
    assert!(graph.last().unwrap().is_end());
    assert_eq!(graph.heads(), vec![graph.last().unwrap().id]);
}

#[tokio::test]
async fn semaphore_numbering_continues_on_a_fresh_board() {
    let mut host = Host::new();
    let runtime = host.boot();
    let first = runtime.start(DEMO, DefinitionMode::Full, "demo").unwrap();
    first.wait_until_settled().await;
    drop(first);

    host.board = Arc::new(SemaphoreBoard::new());
    let runtime = restart(&host, runtime).await;
    let second = runtime.start(DEMO, DefinitionMode::Full, "demo").unwrap();
    second.wait_until_settled().await;

    let mut keys: Vec<String> = runtime
        .list_pending(Some("semaphore"))
        .into_iter()
        .filter_map(|p| p.status)
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["wait/1".to_string(), "wait/2".to_string()]);

    assert!(semaphore::release(&runtime, "wait/2", Value::Null));
    assert_eq!(second.wait_for_completion().await.unwrap(), RunStatus::Success);
    assert_eq!(runtime.list_pending(Some("semaphore")).len(), 1);
}

fn counter_definition() -> Construct {
    seq(vec![
        set_var("count", Expr::lit(0i64)),
        retry(
            3,
            seq(vec![
                semaphore_step("wait"),
                Construct::If {
                    cond: Expr::lt(Expr::var("count"), Expr::lit(2i64)),
                    then: Box::new(seq(vec![
                        set_var("count", Expr::add(Expr::var("count"), Expr::lit(1i64))),
                        step("error", &[("message", Expr::lit("died"))]),
                    ])),
                    otherwise: None,
                },
            ]),
        ),
    ])
}

async fn counter_across_two_restarts(host: Host) {
    init_tracing();
    let runtime = host.boot();
    let definition = flowcore::Definition::new("restartable", counter_definition());
    let execution = runtime.start_definition(definition, "restartable").unwrap();
    let run = execution.run_id();
    execution.wait_until_settled().await;
    drop(execution);

    let runtime = restart(&host, runtime).await;
    assert!(semaphore::release(&runtime, "wait/1", Value::Null));
    runtime.wait_until_settled().await;
    let pending = runtime.list_pending(Some("semaphore"));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status.as_deref(), Some("wait/2"));

    let runtime = restart(&host, runtime).await;
    assert!(semaphore::release(&runtime, "wait/2", Value::Null));
    runtime.wait_until_settled().await;
    assert!(semaphore::release(&runtime, "wait/3", Value::Null));

    let execution = runtime.execution(run).unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    assert_eq!(execution.variable("count").await, Some(Value::Int(2)));
    assert_eq!(count_lines(&runtime, run, "Retrying"), 2);
    assert_eq!(count_lines(&runtime, run, "ERROR: died"), 2);
    assert!(runtime.list_pending(None).is_empty());
}

#[tokio::test]
async fn retry_counter_survives_two_restarts_in_memory() {
    counter_across_two_restarts(Host::new()).await;
}

#[tokio::test]
async fn retry_counter_survives_two_restarts_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileContinuationStore::new(dir.path().join("runs")));
    counter_across_two_restarts(Host::with_store(store)).await;
}

#[tokio::test]
async fn retry_always_failing_records_each_attempt() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new(
        "always-fails",
        retry(3, step("error", &[("message", Expr::lit("nope"))])),
    );
    let execution = runtime.start_definition(definition, "always-fails").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Failure);

    let graph = execution.graph().await;
    let failed_atoms = graph
        .nodes()
        .iter()
        .filter(|n| matches!(&n.kind, FlowNodeKind::Atom { step } if step == "error") && n.error.is_some())
        .count();
    assert_eq!(failed_atoms, 3);
    assert_eq!(count_lines(&runtime, execution.run_id(), "Retrying"), 2);
    assert_eq!(
        graph.last().and_then(|n| n.error.as_ref()).map(|e| e.message.as_str()),
        Some("nope")
    );
}

#[tokio::test]
async fn retry_stops_at_first_success() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new(
        "eventually",
        seq(vec![
            set_var("n", Expr::lit(0i64)),
            retry(
                5,
                seq(vec![
                    set_var("n", Expr::add(Expr::var("n"), Expr::lit(1i64))),
                    Construct::If {
                        cond: Expr::lt(Expr::var("n"), Expr::lit(3i64)),
                        then: Box::new(step("error", &[("message", Expr::lit("not yet"))])),
                        otherwise: None,
                    },
                ]),
            ),
        ]),
    );
    let execution = runtime.start_definition(definition, "eventually").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    assert_eq!(execution.variable("n").await, Some(Value::Int(3)));
    assert_eq!(count_lines(&runtime, execution.run_id(), "Retrying"), 2);
}

#[tokio::test]
async fn environment_overrides_and_agent_snapshot_survive_restart() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new(
        "env",
        Construct::Node {
            label: "linux".to_string(),
            body: Box::new(seq(vec![
                set_env("BUILD_TAG", Expr::lit("custom")),
                semaphore_step("env"),
                echo("${env.BUILD_TAG}2"),
                set_env("BUILD_TAG", Expr::template("${env.BUILD_TAG}2")),
                echo("tag ${env.BUILD_TAG}"),
                echo("machine ${env.PERMACHINE}"),
                echo("controller [${env.CONTROLLER_ONLY}]"),
                set_var("global", Expr::lit("global")),
                set_env("global", Expr::lit("env.global")),
                set_env("fallback", Expr::lit("env.fallback")),
                echo("${global} vs. ${fallback}"),
            ])),
        },
    );
    let execution = runtime.start_definition(definition, "env").unwrap();
    let run = execution.run_id();
    execution.wait_until_settled().await;
    drop(execution);

    let runtime = restart(&host, runtime).await;
    let execution = runtime.execution(run).unwrap();
    let pending = execution.pending_steps().await;
    let overlay = execution.environment(pending.first().copied()).await;
    assert_eq!(overlay.resolve("BUILD_TAG"), Some(("custom", "run")));
    assert_eq!(overlay.resolve("PERMACHINE"), Some(("set", "agent:linux")));
    assert_eq!(overlay.resolve("K"), Some(("v0", "ambient")));
    assert_eq!(overlay.get("CONTROLLER_ONLY"), None);

    assert!(semaphore::release(&runtime, "env/1", Value::Null));
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    let log = execution.log();
    assert!(log.contains("custom2"));
    assert!(log.contains("tag custom2"));
    assert!(log.contains("machine set"));
    assert!(log.contains("controller []"));
    assert!(log.contains("global vs. env.fallback"));
}

#[tokio::test]
async fn block_scope_outranks_run_override_outranks_ambient() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new(
        "precedence",
        seq(vec![
            echo("first ${env.K}"),
            set_env("K", Expr::lit("v1")),
            Construct::WithEnv {
                vars: BTreeMap::from([("K".to_string(), Expr::lit("v2"))]),
                body: Box::new(echo("inside ${env.K}")),
            },
            echo("outside ${env.K}"),
        ]),
    );
    let execution = runtime.start_definition(definition, "precedence").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    let log = execution.log();
    assert!(log.contains("first v0"));
    assert!(log.contains("inside v2"));
    assert!(log.contains("outside v1"));
}

const AUTH: &str = r#"{
    "name": "auth",
    "body": {"sequence": [
        {"step": {"name": "check_auth"}},
        {"as_identity": {"principal": "deployer", "body":
            {"step": {"name": "whoami", "args": {"message": {"lit": "still running as"}}}}}},
        {"step": {"name": "whoami", "args": {"message": {"lit": "finally running as"}}, "bind": "who"}}
    ]}
}"#;

#[tokio::test]
async fn identity_is_stable_across_restart() {
    let mut host = Host::new();
    host.identity = Arc::new(StaticIdentityProvider::new().assign("auth", "someone"));
    let runtime = host.boot();

    let execution = runtime.start(AUTH, DefinitionMode::Full, "auth").unwrap();
    let run = execution.run_id();
    execution.wait_until_settled().await;
    assert!(execution.log().contains("running as someone"));
    drop(execution);

    let runtime = restart(&host, runtime).await;
    let execution = runtime.execution(run).unwrap();
    assert!(execution.log().contains("again running as someone"));
    assert_eq!(execution.current_identity(None).await.name(), "someone");

    let pending = runtime.list_pending(Some("check_auth"));
    assert_eq!(pending.len(), 1);
    runtime.complete_pending(pending[0].step_id, Ok(Value::Null)).await.unwrap();

    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    let log = execution.log();
    assert!(log.contains("still running as deployer"));
    assert!(log.contains("finally running as someone"));
    assert_eq!(execution.variable("who").await, Some(Value::from("someone")));
}

#[tokio::test]
async fn identity_policy_decides_whether_reassignment_applies() {
    for (policy, expected) in [
        (IdentityPolicy::ResolveOnResume, "newcomer"),
        (IdentityPolicy::ResolveOnce, "someone"),
    ] {
        let mut host = Host::new();
        host.config.identity_policy = policy;
        host.identity = Arc::new(StaticIdentityProvider::new().assign("auth", "someone"));
        let runtime = host.boot();
        let execution = runtime.start(AUTH, DefinitionMode::Full, "auth").unwrap();
        let run = execution.run_id();
        execution.wait_until_settled().await;
        drop(execution);

        host.identity = Arc::new(StaticIdentityProvider::new().assign("auth", "newcomer"));
        let runtime = restart(&host, runtime).await;
        let execution = runtime.execution(run).unwrap();
        assert_eq!(execution.current_identity(None).await.name(), expected, "{policy:?}");
        assert!(execution.log().contains(&format!("again running as {expected}")));
    }
}

#[tokio::test]
async fn unassigned_jobs_run_as_system() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new("who", step("whoami", &[]));
    let execution = runtime.start_definition(definition, "who").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    assert!(execution.log().contains("running as SYSTEM"));
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(u64, FlowNodeKind)>>,
}

impl GraphListener for Recorder {
    fn on_new_head(&self, _run_id: RunId, node: &FlowNode) {
        self.seen.lock().unwrap().push((node.id, node.kind.clone()));
    }
}

#[tokio::test]
async fn listener_sees_every_node_in_append_order() {
    let host = Host::new();
    let recorder = Arc::new(Recorder::default());
    let runtime = FlowRuntime::builder()
        .registry(standard_registry(&host.board))
        .store(Arc::clone(&host.store))
        .listener(recorder.clone())
        .build();

    let definition = flowcore::Definition::new("listen", seq(vec![echo("one"), echo("two")]));
    let execution = runtime.start_definition(definition, "listen").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);

    let graph_len = execution.graph().await.len();
    let seen = recorder.seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&(1, FlowNodeKind::Start)));
    assert_eq!(seen.last().map(|(_, k)| k), Some(&FlowNodeKind::End));
    let ids: Vec<u64> = seen.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, (1..=ids.len() as u64).collect::<Vec<_>>());
    assert_eq!(seen.len(), graph_len);
}

#[tokio::test]
async fn duplicate_completion_is_rejected() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new("dup", semaphore_step("dup"));
    let execution = runtime.start_definition(definition, "dup").unwrap();
    execution.wait_until_settled().await;

    let mut results = Vec::new();
    let applied = runtime.apply_to_all::<SemaphoreStep, _>(|_, ctx| {
        results.push(ctx.on_success(1i64));
        results.push(ctx.on_success(2i64));
    });
    assert_eq!(applied, 1);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());

    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    let stale = uuid::Uuid::new_v4();
    assert!(matches!(
        execution.advance(stale, Ok(Value::Null)).await,
        Err(FlowError::AlreadyCompleted(_))
    ));
    assert!(matches!(
        runtime.complete_pending(stale, Ok(Value::Null)).await,
        Err(FlowError::AlreadyCompleted(_))
    ));
}

#[tokio::test]
async fn abort_unwinds_every_scope_without_retry_or_catch() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new(
        "abort",
        Construct::WithEnv {
            vars: BTreeMap::from([("X".to_string(), Expr::lit("1"))]),
            body: Box::new(retry(
                3,
                Construct::Try {
                    body: Box::new(step("sleep", &[("millis", Expr::lit(60_000i64))])),
                    catch: Box::new(echo("caught")),
                    bind: None,
                },
            )),
        },
    );
    let execution = runtime.start_definition(definition, "abort").unwrap();
    let run = execution.run_id();
    execution.wait_until_settled().await;
    assert_eq!(runtime.list_pending(Some("sleep")).len(), 1);

    assert_eq!(runtime.abort(run, "stopped by test").await.unwrap(), RunStatus::Aborted);
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Aborted);
    assert!(runtime.list_pending(None).is_empty());

    let log = execution.log();
    assert!(!log.contains("caught"));
    assert!(!log.contains("Retrying"));
    let graph = execution.graph().await;
    let failed_block_ends = graph
        .nodes()
        .iter()
        .filter(|n| matches!(n.kind, FlowNodeKind::BlockEnd { .. }) && n.error.is_some())
        .count();
    assert_eq!(failed_block_ends, 3);
    assert!(graph.last().unwrap().error.as_ref().unwrap().is_abort());

    let stored = host.store.load(run).await.unwrap();
    assert_eq!(stored.run.status, RunStatus::Aborted);
}

#[tokio::test]
async fn try_catch_binds_the_failure_message() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new(
        "catch",
        Construct::Try {
            body: Box::new(step("error", &[("message", Expr::lit("boom"))])),
            catch: Box::new(echo("caught ${err}")),
            bind: Some("err".to_string()),
        },
    );
    let execution = runtime.start_definition(definition, "catch").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    assert!(execution.log().contains("caught boom"));
}

#[tokio::test]
async fn unstable_marks_result_and_failure_outranks_it() {
    let host = Host::new();
    let runtime = host.boot();

    let unstable = flowcore::Definition::new("u", seq(vec![step("unstable", &[]), echo("done")]));
    let execution = runtime.start_definition(unstable, "u").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Unstable);

    let failing = flowcore::Definition::new(
        "uf",
        seq(vec![step("unstable", &[]), step("error", &[("message", Expr::lit("x"))])]),
    );
    let execution = runtime.start_definition(failing, "uf").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Failure);
}

#[tokio::test]
async fn restricted_mode_runs_sync_blocks_and_fails_pending_steps() {
    let host = Host::new();
    let runtime = host.boot();
    let execution = runtime.start(DEMO, DefinitionMode::Restricted, "demo").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Failure);
    assert!(execution.log().contains("restricted mode"));
    assert!(host.store.load(execution.run_id()).await.is_err());
    assert!(runtime.list_pending(None).is_empty());

    let machine = flowcore::Definition::new(
        "on-linux",
        Construct::Node {
            label: "linux".to_string(),
            body: Box::new(echo("machine ${env.PERMACHINE}")),
        },
    )
    .with_mode(DefinitionMode::Restricted);
    let execution = runtime.start_definition(machine, "on-linux").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    assert!(execution.log().contains("machine set"));

    let waits_on_linux = flowcore::Definition::new(
        "waits-on-linux",
        Construct::Node {
            label: "linux".to_string(),
            body: Box::new(semaphore_step("held")),
        },
    )
    .with_mode(DefinitionMode::Restricted);
    let execution = runtime.start_definition(waits_on_linux, "waits-on-linux").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Failure);
    assert!(runtime.list_pending(None).is_empty());

    let parallel = r#"{"name": "p", "body": {"parallel": [
        {"name": "a", "body": {"step": {"name": "echo"}}}
    ]}}"#;
    assert!(matches!(
        runtime.start(parallel, DefinitionMode::Restricted, "p"),
        Err(FlowError::Definition(flowcore::DefinitionError::NotAllowedInRestrictedMode { .. }))
    ));
    assert!(matches!(
        runtime.start(r#"{"name": "x", "body": {"step": {"name": "nope"}}}"#, DefinitionMode::Full, "x"),
        Err(FlowError::Definition(flowcore::DefinitionError::UnknownStep(_)))
    ));
}

#[tokio::test]
async fn parallel_branches_join_after_restart() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new(
        "fan-out",
        Construct::Parallel(vec![
            Branch {
                name: "a".to_string(),
                body: semaphore_step("a"),
            },
            Branch {
                name: "b".to_string(),
                body: echo("b done"),
            },
        ]),
    );
    let execution = runtime.start_definition(definition, "fan-out").unwrap();
    let run = execution.run_id();
    assert_eq!(execution.wait_until_settled().await, ExecutionPhase::Suspended { pending: 1 });
    assert!(execution.log().contains("b done"));
    drop(execution);

    let runtime = restart(&host, runtime).await;
    assert!(semaphore::release(&runtime, "a/1", Value::Null));
    let execution = runtime.execution(run).unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);

    let graph = execution.graph().await;
    graph.verify().unwrap();
    let fork = graph
        .nodes()
        .iter()
        .find(|n| matches!(&n.kind, FlowNodeKind::BlockStart { block } if block == "parallel"))
        .unwrap()
        .id;
    let join = graph
        .nodes()
        .iter()
        .find(|n| n.kind == FlowNodeKind::BlockEnd { start: fork })
        .unwrap();
    assert_eq!(join.parents.len(), 2);
}

#[tokio::test]
async fn parallel_fails_with_first_failed_branch() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new(
        "fan-out-fail",
        Construct::Parallel(vec![
            Branch {
                name: "ok".to_string(),
                body: echo("fine"),
            },
            Branch {
                name: "bad".to_string(),
                body: step("error", &[("message", Expr::lit("first"))]),
            },
            Branch {
                name: "worse".to_string(),
                body: step("error", &[("message", Expr::lit("second"))]),
            },
        ]),
    );
    let execution = runtime.start_definition(definition, "fan-out-fail").unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Failure);
    let graph = execution.graph().await;
    assert_eq!(
        graph.last().and_then(|n| n.error.as_ref()).map(|e| e.message.as_str()),
        Some("first")
    );
}

#[tokio::test]
async fn sleep_rearms_after_restart() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new(
        "nap",
        seq(vec![step("sleep", &[("millis", Expr::lit(200i64))]), echo("awake")]),
    );
    let execution = runtime.start_definition(definition, "nap").unwrap();
    let run = execution.run_id();
    execution.wait_until_settled().await;
    drop(execution);

    let runtime = restart(&host, runtime).await;
    let execution = runtime.execution(run).unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    assert!(execution.log().contains("awake"));
}

#[tokio::test]
async fn out_of_range_sleep_fails_the_run() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new("forever", step("sleep", &[("millis", Expr::lit(i64::MAX))]));
    let execution = runtime.start_definition(definition, "forever").unwrap();
    let status = tokio::time::timeout(std::time::Duration::from_secs(5), execution.wait_for_completion())
        .await
        .expect("run settles")
        .unwrap();
    assert_eq!(status, RunStatus::Failure);
    let graph = execution.graph().await;
    assert!(graph
        .nodes()
        .iter()
        .any(|n| n.error.as_ref().is_some_and(|e| e.message.contains("out of range"))));
}

#[tokio::test]
async fn completing_a_sleep_early_cancels_its_timer() {
    let host = Host::new();
    let runtime = host.boot();
    let definition = flowcore::Definition::new("nap", step("sleep", &[("millis", Expr::lit(60_000i64))]));
    let execution = runtime.start_definition(definition, "nap").unwrap();
    execution.wait_until_settled().await;

    let mut timer = None;
    let seen = runtime.apply_to_all_pending(|p| p.kind == "sleep", |_, ctx| timer = Some(ctx.cancellation.clone()));
    assert_eq!(seen, 1);
    let timer = timer.unwrap();
    assert!(!timer.is_cancelled());

    let step_id = runtime.list_pending(Some("sleep"))[0].step_id;
    runtime.complete_pending(step_id, Ok(Value::Null)).await.unwrap();
    assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    assert!(timer.is_cancelled());
}

#[tokio::test]
async fn missing_step_kind_fails_only_that_run() {
    let host = Host::new();
    let runtime = host.boot();
    let waiting = runtime
        .start_definition(flowcore::Definition::new("w", semaphore_step("w")), "w")
        .unwrap();
    waiting.wait_until_settled().await;
    let done = runtime
        .start_definition(flowcore::Definition::new("d", echo("done")), "d")
        .unwrap();
    done.wait_for_completion().await.unwrap();
    let (waiting_id, done_id) = (waiting.run_id(), done.run_id());
    drop((waiting, done, runtime));

    let mut registry = StepRegistry::new();
    flownodes::register_all(&mut registry, &host.board);
    let mut bare = StepRegistry::new();
    for name in registry.list_function_names() {
        if name != "semaphore" {
            bare.register(registry.get(&name).unwrap());
        }
    }
    let runtime = host.boot_with(bare);
    let report = runtime.resume_all().await.unwrap();
    assert!(report.resumed.is_empty());
    assert_eq!(report.finished, vec![done_id]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, waiting_id);
    assert!(report.failed[0].1.contains("semaphore"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn apply_to_all_pending_never_sees_partial_steps() {
    let host = Host::new();
    let runtime = Arc::new(host.boot());
    const RUNS: usize = 20;

    let observer = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            let mut observed = 0;
            for _ in 0..200 {
                runtime.apply_to_all::<SemaphoreStep, _>(|step, _| {
                    assert!(step.key().is_some(), "observed a semaphore before it started");
                    observed += 1;
                });
                runtime.apply_to_all_pending(
                    |info| info.kind == "semaphore",
                    |_, ctx| assert!(!ctx.completion.is_completed()),
                );
                tokio::task::yield_now().await;
            }
            observed
        })
    };

    let mut executions = Vec::new();
    for i in 0..RUNS {
        let definition = flowcore::Definition::new(format!("c{i}"), semaphore_step("c"));
        executions.push(runtime.start_definition(definition, "concurrent").unwrap());
    }
    runtime.wait_until_settled().await;
    observer.await.unwrap();
    assert_eq!(runtime.list_pending(Some("semaphore")).len(), RUNS);

    for n in 1..=RUNS {
        assert!(semaphore::release(&runtime, &format!("c/{n}"), Value::Int(n as i64)));
    }
    for execution in executions {
        assert_eq!(execution.wait_for_completion().await.unwrap(), RunStatus::Success);
    }
    assert!(runtime.list_pending(None).is_empty());
}
