use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use atrium_bus::{Backend, BackendDelta, DriverConfig, ScriptedBackend};
use atrium_protocol::{
    AgentActivity, AgentConfig, ContainerId, DriveableEvent, Lifecycle, Role, RuntimeError,
};
use atrium_runtime::{Runtime, RuntimeAgent, RuntimeBuilder};
use futures_util::StreamExt;

fn unique_test_root(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("atrium-{name}-{nanos}"))
}

fn scripted_runtime(name: &str) -> (Runtime, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::with_reply("hello from atrium"));
    let runtime = RuntimeBuilder::new(unique_test_root(name))
        .with_driver_config(DriverConfig {
            idle_timeout: Duration::from_secs(2),
        })
        .with_backend(Arc::clone(&backend) as Arc<dyn Backend>)
        .build();
    (runtime, backend)
}

/// Drive one exchange to completion, recording the agent's activity after
/// every yielded event.
async fn drain_exchange(
    agent: &Arc<RuntimeAgent>,
    content: &str,
) -> anyhow::Result<(Vec<DriveableEvent>, Vec<AgentActivity>)> {
    let mut exchange = agent.send_message(content)?;
    let mut events = Vec::new();
    let mut activities = Vec::new();
    while let Some(item) = exchange.events.next().await {
        events.push(item?);
        activities.push(agent.activity());
    }
    Ok((events, activities))
}

#[tokio::test]
async fn full_conversation_scenario() -> anyhow::Result<()> {
    let (runtime, _backend) = scripted_runtime("scenario");
    let container_id = ContainerId::from_string("c1");
    let container = runtime.create_container(container_id.clone()).await?;

    let agent = container
        .run_agent(AgentConfig::new("a1", "be concise"))
        .await?;
    assert_eq!(agent.lifecycle(), Lifecycle::Running);
    assert_eq!(agent.activity(), AgentActivity::Idle);

    let (events, activities) = drain_exchange(&agent, "Hello").await?;
    assert_eq!(
        events,
        vec![
            DriveableEvent::MessageStart,
            DriveableEvent::TextDelta {
                delta: "hello from atrium".into()
            },
            DriveableEvent::MessageStop,
        ]
    );
    assert_eq!(
        activities,
        vec![
            AgentActivity::Thinking,
            AgentActivity::Responding,
            AgentActivity::Idle,
        ]
    );

    // Exactly one assistant message was appended.
    let messages = agent.session().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Hello");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "hello from atrium");

    let agent_id = agent.agent_id().clone();
    assert!(runtime.destroy_agent(&container_id, &agent_id).await);
    assert_eq!(container.agent_count(), 0);
    assert!(!runtime.destroy_agent(&container_id, &agent_id).await);
    Ok(())
}

#[tokio::test]
async fn stopped_agent_rejects_messages_without_touching_the_session() -> anyhow::Result<()> {
    let (runtime, _backend) = scripted_runtime("stopped");
    let container = runtime
        .create_container(ContainerId::from_string("c1"))
        .await?;
    let agent = container.run_agent(AgentConfig::new("a1", "")).await?;

    agent.stop()?;
    assert_eq!(agent.lifecycle(), Lifecycle::Stopped);

    let rejected = agent.send_message("Hello");
    assert!(matches!(rejected, Err(RuntimeError::SendToStoppedAgent)));
    assert_eq!(agent.session().message_count(), 0);

    // Stop and resume alternate freely.
    agent.resume()?;
    assert_eq!(agent.lifecycle(), Lifecycle::Running);
    let (_, activities) = drain_exchange(&agent, "Hello").await?;
    assert_eq!(activities.last(), Some(&AgentActivity::Idle));
    Ok(())
}

#[tokio::test]
async fn destroyed_agent_cannot_be_resumed() -> anyhow::Result<()> {
    let (runtime, _backend) = scripted_runtime("destroyed");
    let container_id = ContainerId::from_string("c1");
    let container = runtime.create_container(container_id.clone()).await?;
    let agent = container.run_agent(AgentConfig::new("a1", "")).await?;
    let agent_id = agent.agent_id().clone();

    assert!(runtime.destroy_agent(&container_id, &agent_id).await);
    assert_eq!(agent.lifecycle(), Lifecycle::Destroyed);

    let resume = agent.resume();
    assert!(matches!(resume, Err(RuntimeError::ResumeDestroyedAgent)));
    assert_eq!(
        resume.unwrap_err().to_string(),
        "cannot resume destroyed agent"
    );
    assert!(matches!(
        agent.send_message("Hello"),
        Err(RuntimeError::AgentDestroyed)
    ));
    Ok(())
}

#[tokio::test]
async fn snapshot_resume_round_trip() -> anyhow::Result<()> {
    let (runtime, _backend) = scripted_runtime("snapshot");
    let container_id = ContainerId::from_string("c1");
    runtime.create_container(container_id.clone()).await?;
    let agent = runtime
        .run_agent(&container_id, AgentConfig::new("a1", "be concise"))
        .await?;

    drain_exchange(&agent, "first").await?;
    let image = runtime
        .snapshot_agent(&container_id, agent.agent_id(), "checkpoint", "after first")
        .await?;
    assert_eq!(image.messages.len(), 2);
    assert!(image.parent_image_id.is_none());

    // Activity after the snapshot must not leak into the image.
    drain_exchange(&agent, "second").await?;
    assert_eq!(agent.session().message_count(), 4);
    assert_eq!(runtime.get_image(&image.image_id).await?.map(|i| i.messages.len()), Some(2));

    let resumed = runtime.resume_image(&image.image_id).await?;
    assert_ne!(resumed.agent_id(), agent.agent_id());
    assert_eq!(resumed.container_id(), &container_id);
    assert_eq!(resumed.lifecycle(), Lifecycle::Running);
    assert_eq!(resumed.session().messages(), image.messages);
    assert_eq!(resumed.source_image_id(), Some(&image.image_id));

    // A snapshot of the resumed agent records its lineage.
    let child = runtime
        .snapshot_agent(&container_id, resumed.agent_id(), "child", "")
        .await?;
    assert_eq!(child.parent_image_id, Some(image.image_id.clone()));
    Ok(())
}

#[tokio::test]
async fn resume_fails_once_the_container_is_disposed() -> anyhow::Result<()> {
    let (runtime, _backend) = scripted_runtime("dispose");
    let container_id = ContainerId::from_string("c1");
    runtime.create_container(container_id.clone()).await?;
    let agent = runtime
        .run_agent(&container_id, AgentConfig::new("a1", ""))
        .await?;
    let image = runtime
        .snapshot_agent(&container_id, agent.agent_id(), "checkpoint", "")
        .await?;

    assert!(runtime.dispose_container(&container_id).await);
    assert!(!runtime.dispose_container(&container_id).await);

    // The image record persists, but the live container is gone.
    assert!(runtime.get_image(&image.image_id).await?.is_some());
    match runtime.resume_image(&image.image_id).await {
        Err(RuntimeError::ContainerNotFound) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("resume must fail without a live container"),
    }

    // The persisted container record was retained through disposal.
    assert!(
        runtime
            .repository()
            .find_container_by_id(&container_id)
            .await?
            .is_some()
    );
    Ok(())
}

#[tokio::test]
async fn duplicate_container_ids_are_rejected() -> anyhow::Result<()> {
    let (runtime, _backend) = scripted_runtime("duplicate");
    let container_id = ContainerId::from_string("c1");
    runtime.create_container(container_id.clone()).await?;
    assert!(matches!(
        runtime.create_container(container_id).await,
        Err(RuntimeError::ContainerExists(_))
    ));
    Ok(())
}

#[tokio::test]
async fn image_registry_list_get_delete() -> anyhow::Result<()> {
    let (runtime, _backend) = scripted_runtime("images");
    let container_id = ContainerId::from_string("c1");
    runtime.create_container(container_id.clone()).await?;
    let agent = runtime
        .run_agent(&container_id, AgentConfig::new("a1", ""))
        .await?;

    let first = runtime
        .snapshot_agent(&container_id, agent.agent_id(), "one", "")
        .await?;
    let second = runtime
        .snapshot_agent(&container_id, agent.agent_id(), "two", "")
        .await?;

    let listed = runtime.list_images().await?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].image_id, first.image_id);
    assert_eq!(listed[1].image_id, second.image_id);

    assert!(runtime.delete_image(&first.image_id).await?);
    assert!(!runtime.delete_image(&first.image_id).await?);
    assert!(runtime.get_image(&first.image_id).await?.is_none());
    assert_eq!(runtime.list_images().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn tool_deltas_record_a_tool_message_and_activity() -> anyhow::Result<()> {
    let (runtime, backend) = scripted_runtime("tools");
    backend.push_script(vec![
        BackendDelta::MessageStart,
        BackendDelta::ToolCall {
            name: "search".into(),
            arguments: serde_json::json!({ "query": "atrium" }),
        },
        BackendDelta::ToolResult {
            name: "search".into(),
            output: serde_json::json!({ "hits": 3 }),
        },
        BackendDelta::TextDelta("found it".into()),
        BackendDelta::MessageStop,
    ]);

    let container_id = ContainerId::from_string("c1");
    runtime.create_container(container_id.clone()).await?;
    let agent = runtime
        .run_agent(&container_id, AgentConfig::new("a1", ""))
        .await?;

    let (events, activities) = drain_exchange(&agent, "use the tool").await?;
    assert_eq!(events.len(), 5);
    assert_eq!(
        activities,
        vec![
            AgentActivity::Thinking,
            AgentActivity::AwaitingToolResult,
            AgentActivity::Thinking,
            AgentActivity::Responding,
            AgentActivity::Idle,
        ]
    );

    // user, tool output, assistant reply.
    let messages = agent.session().messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].role, Role::Tool);
    assert_eq!(messages[2].content, "found it");
    Ok(())
}
