use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use atrium_bus::{DriverConfig, ScriptedBackend};
use atrium_mirror::{Channel, LocalChannel, MirrorConfig, MirrorRuntime, Peer};
use atrium_protocol::{
    AgentActivity, AgentConfig, AgentId, ContainerId, EventContext, EventKind, Lifecycle,
    RequestId, Role, RuntimeError, SystemEvent,
};
use atrium_runtime::{Runtime, RuntimeBuilder};

fn unique_test_root(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("atrium-{name}-{nanos}"))
}

fn fast_mirror_config() -> MirrorConfig {
    MirrorConfig {
        request_timeout: Duration::from_secs(2),
    }
}

/// Server runtime and connected mirror over an in-process channel pair.
async fn mirrored_runtime(name: &str) -> anyhow::Result<(Arc<Runtime>, Peer, MirrorRuntime)> {
    let runtime = Arc::new(
        RuntimeBuilder::new(unique_test_root(name))
            .with_driver_config(DriverConfig {
                idle_timeout: Duration::from_secs(2),
            })
            .with_backend(Arc::new(ScriptedBackend::with_reply("mirrored reply")))
            .build(),
    );
    let (client_half, server_half) = LocalChannel::pair();
    let peer = Peer::serve(Arc::clone(&runtime), Arc::new(server_half)).await?;
    let mirror = MirrorRuntime::connect(Arc::new(client_half), fast_mirror_config()).await?;
    Ok((runtime, peer, mirror))
}

/// Poll until `check` passes or the deadline elapses.
async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn mirror_reconstructs_a_full_conversation() -> anyhow::Result<()> {
    let (_runtime, _peer, mirror) = mirrored_runtime("conversation").await?;

    let container = mirror
        .create_container(ContainerId::from_string("c1"))
        .await?;
    assert!(container.record().is_some());

    let agent = container
        .run_agent(AgentConfig::new("a1", "be concise"))
        .await?;
    assert_eq!(agent.lifecycle(), Some(Lifecycle::Running));
    assert_eq!(agent.activity(), Some(AgentActivity::Idle));

    agent.send_message("Hello").await?;
    wait_until("assistant reply to arrive", || {
        agent
            .messages()
            .iter()
            .any(|m| m.role == Role::Assistant && m.content == "mirrored reply")
    })
    .await;
    wait_until("activity to settle", || {
        agent.activity() == Some(AgentActivity::Idle)
    })
    .await;

    // The forwarded user_message was mirrored too.
    let messages = agent.messages();
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Hello");

    let agent_id = agent.agent_id().clone();
    assert!(container.destroy_agent(&agent_id).await?);
    assert_eq!(container.agent_count(), 0);
    assert!(!container.destroy_agent(&agent_id).await?);
    Ok(())
}

#[tokio::test]
async fn snapshot_and_resume_through_the_mirror() -> anyhow::Result<()> {
    let (_runtime, _peer, mirror) = mirrored_runtime("snapshot").await?;
    let container = mirror
        .create_container(ContainerId::from_string("c1"))
        .await?;
    let agent = container.run_agent(AgentConfig::new("a1", "")).await?;

    agent.send_message("Hello").await?;
    wait_until("exchange to finish", || {
        agent.messages().iter().any(|m| m.role == Role::Assistant)
    })
    .await;

    let image = agent.snapshot("checkpoint", "after hello").await?;
    let record = image.record().ok_or_else(|| anyhow::anyhow!("image not cached"))?;
    assert_eq!(record.messages.len(), 2);

    let listed = mirror.list_images().await?;
    assert_eq!(listed.len(), 1);
    assert!(mirror.get_image(image.image_id()).await?.is_some());

    let resumed = image.resume().await?;
    assert_ne!(resumed.agent_id(), agent.agent_id());
    assert_eq!(resumed.container_id(), container.container_id());
    assert_eq!(resumed.lifecycle(), Some(Lifecycle::Running));
    assert_eq!(container.agent_count(), 2);

    image.delete().await?;
    assert!(image.record().is_none());
    Ok(())
}

#[tokio::test]
async fn stop_and_resume_propagate_lifecycle() -> anyhow::Result<()> {
    let (runtime, _peer, mirror) = mirrored_runtime("lifecycle").await?;
    let container = mirror
        .create_container(ContainerId::from_string("c1"))
        .await?;
    let agent = container.run_agent(AgentConfig::new("a1", "")).await?;

    agent.stop().await?;
    assert_eq!(agent.lifecycle(), Some(Lifecycle::Stopped));
    let server_agent = runtime
        .agent(&ContainerId::from_string("c1"), agent.agent_id())
        .ok_or_else(|| anyhow::anyhow!("agent missing on server"))?;
    assert_eq!(server_agent.lifecycle(), Lifecycle::Stopped);

    agent.resume().await?;
    assert_eq!(agent.lifecycle(), Some(Lifecycle::Running));
    assert_eq!(server_agent.lifecycle(), Lifecycle::Running);
    Ok(())
}

#[tokio::test]
async fn server_errors_reject_the_request() -> anyhow::Result<()> {
    let (_runtime, _peer, mirror) = mirrored_runtime("errors").await?;
    mirror
        .create_container(ContainerId::from_string("c1"))
        .await?;

    let error = mirror
        .create_container(ContainerId::from_string("c1"))
        .await
        .err()
        .expect("duplicate container must be rejected");
    match error {
        RuntimeError::RequestFailed(message) => {
            assert!(message.contains("already exists"), "unexpected: {message}");
        }
        other => panic!("expected request_failed, got {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn mismatched_request_id_leaves_the_pending_entry_until_timeout() -> anyhow::Result<()> {
    let (client_half, server_half) = LocalChannel::pair();
    let server_half = Arc::new(server_half);
    server_half.connect().await?;

    // A rogue server that answers every request under the wrong id.
    let responder = Arc::clone(&server_half);
    let mut inbound = server_half.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = inbound.recv().await {
            let response = SystemEvent::response(
                RequestId::from_string("not-the-request"),
                event.context.clone(),
                EventKind::ContainerCreateResponse {
                    record: atrium_protocol::ContainerRecord::new(ContainerId::from_string("c1")),
                },
            );
            let _ = responder.send(&response).await;
        }
    });

    let mirror = MirrorRuntime::connect(
        Arc::new(client_half),
        MirrorConfig {
            request_timeout: Duration::from_millis(100),
        },
    )
    .await?;

    let started = tokio::time::Instant::now();
    let result = mirror
        .create_container(ContainerId::from_string("c1"))
        .await;
    assert!(matches!(result, Err(RuntimeError::RequestTimeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(100));
    // The wrong-id response never materialized local state either.
    assert!(mirror.container(&ContainerId::from_string("c1")).is_none());
    Ok(())
}

#[tokio::test]
async fn notifications_update_mirror_state_unconditionally() -> anyhow::Result<()> {
    let (client_half, server_half) = LocalChannel::pair();
    let server_half = Arc::new(server_half);
    server_half.connect().await?;

    let mirror = MirrorRuntime::connect(Arc::new(client_half), fast_mirror_config()).await?;
    let container_id = ContainerId::from_string("c1");
    let agent_id = AgentId::from_string("a1");

    server_half
        .send(&SystemEvent::lifecycle(
            EventContext::container(container_id.clone()),
            EventKind::ContainerCreated {
                container_id: container_id.clone(),
            },
        ))
        .await?;
    server_half
        .send(&SystemEvent::lifecycle(
            EventContext::agent(container_id.clone(), agent_id.clone()),
            EventKind::AgentRegistered {
                container_id: container_id.clone(),
                agent_id: agent_id.clone(),
            },
        ))
        .await?;

    wait_until("pushed state to arrive", || {
        mirror
            .container(&container_id)
            .is_some_and(|c| c.agent_count() == 1)
    })
    .await;

    let container = mirror
        .container(&container_id)
        .ok_or_else(|| anyhow::anyhow!("container not mirrored"))?;
    assert!(container.agent(&agent_id).is_some());
    Ok(())
}
