//! Shared fixtures: an in-memory helper backed by the real helper runtime,
//! scripted prompt agents and a broker wired to them.

#![allow(dead_code)]

use async_trait::async_trait;
use elevate_contracts::{ActionReply, ArgumentMap};
use elevate_core::auth::{PromptAgent, PromptOutcome, PromptRequest};
use elevate_core::helper::{HelperChannel, HelperProcess, HelperSpawner};
use elevate_core::{Broker, BrokerConfig, HelperManifest, HelperRegistry};
use elevate_helper::{HelperRuntime, handler_fn};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const HELPER_ID: &str = "org.test.helper";

pub const MANIFEST: &str = r#"
id = "org.test.helper"
executable = "/nonexistent/test-helper"
max_concurrent = 8

[[actions]]
name = "org.example.write"
message = "Writing needs authentication"

[[actions]]
name = "org.example.read"
policy = "yes"

[[actions]]
name = "org.test.progress"
policy = "yes"

[[actions]]
name = "org.test.slow"
policy = "yes"

[[actions]]
name = "org.test.crash"
policy = "yes"

[[actions]]
name = "org.test.denied"
policy = "no"
"#;

pub const POLICY: &str = r#"
[defaults]
"org.example.*" = "auth_admin"
"org.example.read" = "yes"
"#;

/// Runtime the in-memory helper serves. `kill` simulates the helper
/// process dying.
pub fn test_runtime(kill: CancellationToken) -> HelperRuntime {
    HelperRuntime::builder(HELPER_ID)
        .max_concurrent(8)
        .action(
            "org.example.write",
            handler_fn(|ctx, args| async move {
                ctx.progress_step(50);
                ActionReply::success()
                    .with_data("written", args.get("path").cloned().unwrap_or(Value::Null))
                    .with_data(
                        "token",
                        ctx.verification_token().map(Value::from).unwrap_or(Value::Null),
                    )
                    .with_data("uid", ctx.caller_uid().map(Value::from).unwrap_or(Value::Null))
            }),
        )
        .action(
            "org.example.read",
            handler_fn(|_ctx, _args| async move { ActionReply::success().with_data("contents", "hello") }),
        )
        .action(
            "org.test.progress",
            handler_fn(|ctx, _args| async move {
                for step in [10, 50, 100] {
                    ctx.progress_step(step);
                }
                let mut data = ArgumentMap::new();
                data.insert("phase".to_string(), Value::from("done"));
                ctx.progress_data(data);
                ActionReply::success()
            }),
        )
        .action(
            "org.test.slow",
            handler_fn(|ctx, args| async move {
                let delay = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(5_000);
                tokio::select! {
                    _ = ctx.stopped() => ActionReply::user_cancelled(),
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => ActionReply::success(),
                }
            }),
        )
        .action(
            "org.test.crash",
            handler_fn(move |_ctx, _args| {
                let kill = kill.clone();
                async move {
                    kill.cancel();
                    std::future::pending::<()>().await;
                    ActionReply::success()
                }
            }),
        )
        .action(
            "org.test.denied",
            handler_fn(|_ctx, _args| async move { ActionReply::success() }),
        )
        .build()
}

/// Spawns in-memory helpers running [`test_runtime`].
#[derive(Default)]
pub struct DuplexSpawner {
    spawns: AtomicUsize,
}

impl DuplexSpawner {
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HelperSpawner for DuplexSpawner {
    async fn spawn(&self, _manifest: &HelperManifest) -> io::Result<HelperChannel> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let (broker_side, mut relay_broker) = tokio::io::duplex(64 * 1024);
        let (mut relay_helper, helper_side) = tokio::io::duplex(64 * 1024);
        let kill = CancellationToken::new();
        let runtime = test_runtime(kill.clone());

        // Killing cuts the relay, so the broker sees EOF even while handler
        // tasks are still holding the helper's writer.
        let relay_kill = kill.clone();
        let task = tokio::spawn(async move {
            let serve = tokio::spawn(async move {
                let (read, write) = tokio::io::split(helper_side);
                let _ = runtime.serve(read, write).await;
            });
            tokio::select! {
                _ = tokio::io::copy_bidirectional(&mut relay_broker, &mut relay_helper) => {}
                _ = relay_kill.cancelled() => {}
            }
            serve.abort();
        });

        let (reader, writer) = tokio::io::split(broker_side);
        Ok(HelperChannel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(DuplexProcess { kill, task }),
        })
    }
}

struct DuplexProcess {
    kill: CancellationToken,
    task: JoinHandle<()>,
}

#[async_trait]
impl HelperProcess for DuplexProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            self.kill.cancel();
            let _ = (&mut self.task).await;
        }
    }
}

/// Prompt agent answering every prompt the same way, optionally only after
/// being released.
pub struct ScriptedPrompt {
    pub calls: AtomicUsize,
    outcome: PromptOutcome,
    gate: Option<Notify>,
}

impl ScriptedPrompt {
    pub fn instant(outcome: PromptOutcome) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outcome,
            gate: None,
        })
    }

    pub fn gated(outcome: PromptOutcome) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outcome,
            gate: Some(Notify::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_waiters();
        }
    }

    pub async fn wait_for_calls(&self, calls: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.calls() < calls {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("prompt was never shown");
    }
}

#[async_trait]
impl PromptAgent for ScriptedPrompt {
    async fn prompt(&self, _request: PromptRequest) -> PromptOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.outcome.clone()
    }
}

pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub spawner: Arc<DuplexSpawner>,
    pub prompt: Arc<ScriptedPrompt>,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> BrokerConfig {
    BrokerConfig {
        policy_path: Some(dir.path().join("policy.toml")),
        helpers_dir: Some(dir.path().join("helpers")),
        socket_path: Some(dir.path().join("broker.sock")),
        default_timeout_ms: 10_000,
        drain_timeout_secs: 1,
        helper_shutdown_grace_ms: 200,
        watch_policy: false,
        ..BrokerConfig::default()
    }
}

pub fn test_registry() -> HelperRegistry {
    registry_from(MANIFEST)
}

pub fn registry_from(manifest: &str) -> HelperRegistry {
    let mut registry = HelperRegistry::empty();
    registry.insert(HelperManifest::from_toml(manifest).unwrap());
    registry
}

pub fn start_broker(prompt: Arc<ScriptedPrompt>) -> TestBroker {
    start_broker_with(prompt, POLICY, |config| config)
}

pub fn start_broker_with(
    prompt: Arc<ScriptedPrompt>,
    policy: &str,
    configure: impl FnOnce(BrokerConfig) -> BrokerConfig,
) -> TestBroker {
    start_broker_with_registry(prompt, policy, test_registry(), configure)
}

pub fn start_broker_with_registry(
    prompt: Arc<ScriptedPrompt>,
    policy: &str,
    registry: HelperRegistry,
    configure: impl FnOnce(BrokerConfig) -> BrokerConfig,
) -> TestBroker {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("policy.toml"), policy).unwrap();
    let spawner = Arc::new(DuplexSpawner::default());
    let broker = Broker::builder(configure(test_config(&dir)))
        .registry(registry)
        .spawner(spawner.clone())
        .prompt_agent(prompt.clone())
        .build()
        .unwrap();
    TestBroker {
        broker,
        spawner,
        prompt,
        dir,
    }
}
