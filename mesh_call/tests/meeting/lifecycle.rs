use std::{collections::BTreeSet, sync::Arc, time::Duration};

use mesh_call::{
    peer::PeerTransport,
    testing::{FailingHistory, MemoryHub, MockDevices, RecordingHistory},
    ChatMessage, Error, NegotiationState, PeerId,
};

use crate::helper::{eventually, within, TestClientBuilder};

#[actix_rt::test]
async fn two_clients_reach_stable_and_leave_cleans_up() -> anyhow::Result<()> {
    let hub = MemoryHub::default();
    let alice = TestClientBuilder::new("Alice").on_hub(&hub, "peer-a").await?;
    let view = alice.wait_for(|v| v.active).await?;
    assert!(view.peers.is_empty());
    assert_eq!(alice.transports.created(&PeerId::from("peer-b")), 0);

    let bob = TestClientBuilder::new("Bob").on_hub(&hub, "peer-b").await?;
    let view = bob.wait_for_state("peer-a", NegotiationState::Stable).await?;
    assert_eq!(view.peers.len(), 1);
    let view = alice
        .wait_for_state("peer-b", NegotiationState::Stable)
        .await?;
    assert_eq!(view.peers[&PeerId::from("peer-b")].display_name, "Bob");

    // the joiner made the only offer
    assert_eq!(bob.transport("peer-a").count_calls("create_offer"), 1);
    assert_eq!(alice.transport("peer-b").count_calls("create_offer"), 0);

    // each side applied the other's candidate
    let to_alice = alice.transport("peer-b");
    let to_bob = bob.transport("peer-a");
    eventually(|| to_alice.applied_candidates().len() == 1 && to_bob.applied_candidates().len() == 1)
        .await?;

    alice
        .wait_for(|v| v.peers_with_video().contains(&&PeerId::from("peer-b")))
        .await?;

    bob.handle.leave().await;
    within(bob.session).await???;
    alice.wait_for(|v| v.peers.is_empty()).await?;
    eventually(|| to_alice.is_closed()).await?;
    assert_eq!(hub.members("abc123"), vec![PeerId::from("peer-a")]);
    Ok(())
}

#[actix_rt::test]
async fn chat_reaches_the_whole_room_with_sender_name() -> anyhow::Result<()> {
    let hub = MemoryHub::default();
    let alice = TestClientBuilder::new("Alice").on_hub(&hub, "peer-a").await?;
    let bob = TestClientBuilder::new("Bob").on_hub(&hub, "peer-b").await?;

    alice.handle.send_chat("hello").await?;
    let expected = ChatMessage {
        sender: "Alice".to_string(),
        text: "hello".to_string(),
    };
    for client in [&alice, &bob] {
        let view = client.wait_for(|v| !v.messages.is_empty()).await?;
        assert_eq!(view.messages, vec![expected.clone()]);
    }
    Ok(())
}

#[actix_rt::test]
async fn leaving_twice_is_harmless() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Bob").scripted("b").await?;
    crate::helper::establish(&client, &script, "b", "a").await?;
    let preview = client.handle.view().local_preview.unwrap();
    let transport = client.transport("a");

    client.handle.leave().await;
    client.handle.leave().await;

    within(client.session).await???;
    assert!(!client.handle.is_active());
    assert!(client.handle.view().peers.is_empty());
    assert!(preview.is_ended());
    assert!(script.is_disconnected());
    eventually(|| transport.is_closed()).await?;
    assert!(matches!(
        client.handle.toggle_audio().await,
        Err(Error::MeetingEnded)
    ));
    Ok(())
}

#[actix_rt::test]
async fn relay_loss_ends_the_session() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Bob").scripted("b").await?;
    crate::helper::establish(&client, &script, "b", "a").await?;
    let transport = client.transport("a");

    script.lose_connection();
    let result = within(client.session).await??;
    assert!(matches!(result, Err(Error::RelayDisconnected)));

    let view = client.handle.view();
    assert!(!view.active);
    assert!(view.peers.is_empty());
    eventually(|| transport.is_closed()).await?;
    Ok(())
}

#[actix_rt::test]
async fn dropped_socket_on_hub_ends_the_session() -> anyhow::Result<()> {
    let hub = MemoryHub::default();
    let alice = TestClientBuilder::new("Alice").on_hub(&hub, "peer-a").await?;
    let bob = TestClientBuilder::new("Bob").on_hub(&hub, "peer-b").await?;
    bob.wait_for_state("peer-a", NegotiationState::Stable).await?;

    hub.drop_connection(&PeerId::from("peer-b"));
    let result = within(bob.session).await??;
    assert!(matches!(result, Err(Error::RelayDisconnected)));
    alice.wait_for(|v| v.peers.is_empty()).await?;
    Ok(())
}

#[actix_rt::test]
async fn denied_capture_aborts_join() {
    let result = TestClientBuilder::new("Bob")
        .devices(MockDevices::denying())
        .scripted("b")
        .await;
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
}

#[actix_rt::test]
async fn history_is_recorded_without_blocking_join() -> anyhow::Result<()> {
    let history = Arc::new(RecordingHistory::default());
    let (client, _script) = TestClientBuilder::new("Bob")
        .history(history.clone())
        .scripted("b")
        .await?;
    assert!(client.handle.is_active());
    eventually(|| history.visits().len() == 1).await?;
    assert_eq!(history.visits()[0].as_str(), "abc123");

    let (client, _script) = TestClientBuilder::new("Bob")
        .history(Arc::new(FailingHistory))
        .scripted("b")
        .await?;
    actix_rt::time::sleep(Duration::from_millis(20)).await;
    assert!(client.handle.is_active());
    Ok(())
}

#[actix_rt::test]
async fn duplicate_join_and_leave_events_keep_registry_consistent() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Zed").scripted("z").await?;
    script.joined("z", "Zed", &["z"]);
    script.joined("a", "A", &["z", "a"]);
    script.joined("a", "A", &["z", "a"]);
    script.left("c");
    script.joined("b", "B", &["z", "a", "b"]);
    script.left("a");
    script.left("a");
    script.joined("c", "C", &["z", "b", "c"]);
    script.left("b");
    script.left("b");
    script.joined("a", "A", &["z", "c", "a"]);

    let expected: BTreeSet<PeerId> = ["a", "c"].into_iter().map(PeerId::from).collect();
    let view = client
        .wait_for(|v| v.peers.keys().cloned().collect::<BTreeSet<_>>() == expected)
        .await?;
    assert!(view
        .peers
        .values()
        .all(|p| p.state == NegotiationState::New));
    // not the latecomer, so nobody was offered to
    assert!(client
        .transports
        .all(&PeerId::from("a"))
        .iter()
        .all(|t| t.count_calls("create_offer") == 0));
    Ok(())
}
