use std::sync::Arc;

use mesh_call::{
    peer::PeerTransport, testing::MockTransportFactory, NegotiationState, PeerId, SdpType,
    SignalPayload,
};

use crate::helper::{answer, eventually, ice, offer, signals_to, within, TestClientBuilder};

#[actix_rt::test]
async fn early_candidates_wait_for_the_remote_description() -> anyhow::Result<()> {
    let (client, mut script) = TestClientBuilder::new("Bob").scripted("b").await?;
    script.joined("b", "Bob", &["b"]);
    script.joined("a", "Alice", &["b", "a"]);
    script.signal("a", &ice("c1"));
    script.signal("a", &ice("c2"));
    script.signal("a", &offer("offer from a"));
    script.signal("a", &ice("c3"));

    let view = client.wait_for_state("a", NegotiationState::Stable).await?;
    assert_eq!(view.peers[&PeerId::from("a")].display_name, "Alice");

    let transport = client.transport("a");
    eventually(|| transport.applied_candidates().len() == 3).await?;
    assert_eq!(transport.applied_candidates(), vec!["c1", "c2", "c3"]);

    let calls = transport.calls();
    let remote_set = calls.iter().position(|c| c == "set_remote:Offer").unwrap();
    let first_candidate = calls.iter().position(|c| c.starts_with("add_ice")).unwrap();
    assert!(remote_set < first_candidate);
    assert_eq!(transport.count_calls("add_ice"), 3);

    let sent = script.drain_sent();
    let signals = signals_to(&sent, "a");
    assert!(signals
        .iter()
        .any(|s| matches!(s, SignalPayload::Sdp(d) if d.kind == SdpType::Answer)));
    assert!(signals.iter().any(|s| matches!(s, SignalPayload::Ice(_))));
    Ok(())
}

#[actix_rt::test]
async fn malformed_signal_changes_nothing() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Bob").scripted("b").await?;
    crate::helper::establish(&client, &script, "b", "a").await?;
    let transport = client.transport("a");
    let calls = transport.calls().len();

    script.signal("a", "not json");
    script.signal("a", "{}");
    script.signal("a", r#"{"sdp":{"type":"offer","sdp":"x"},"ice":{"candidate":"c"}}"#);
    script.signal("a", r#"{"sdp":{"type":"pranswer","sdp":"x"}}"#);
    script.push(mesh_call::RelayEvent::Chat {
        sender: "Alice".to_string(),
        text: "marker".to_string(),
    });

    let view = client.wait_for(|v| !v.messages.is_empty()).await?;
    assert_eq!(
        view.peer_state(&PeerId::from("a")),
        Some(NegotiationState::Stable)
    );
    assert_eq!(transport.calls().len(), calls);
    assert_eq!(client.transports.created(&PeerId::from("a")), 1);
    Ok(())
}

#[actix_rt::test]
async fn failed_remote_description_only_drops_that_peer() -> anyhow::Result<()> {
    let transports = Arc::new(MockTransportFactory::default());
    transports.fail_set_remote_for(&PeerId::from("a"));
    let (client, script) = TestClientBuilder::new("Carol")
        .transports(transports)
        .scripted("c")
        .await?;

    script.joined("c", "Carol", &["a", "b", "c"]);
    client
        .wait_for(|v| {
            v.peers.len() == 2
                && v.peers
                    .values()
                    .all(|p| p.state == NegotiationState::OfferSent)
        })
        .await?;
    let failing = client.transport("a");

    script.signal("a", &answer("answer from a"));
    script.signal("b", &answer("answer from b"));

    let view = client
        .wait_for(|v| {
            v.peers.len() == 1 && v.peer_state(&PeerId::from("b")) == Some(NegotiationState::Stable)
        })
        .await?;
    assert!(view.active);
    eventually(|| failing.is_closed()).await?;
    Ok(())
}

#[actix_rt::test]
async fn unexpected_answer_is_ignored() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Bob").scripted("b").await?;
    script.joined("b", "Bob", &["b"]);
    script.joined("a", "Alice", &["b", "a"]);
    script.signal("a", &answer("nobody asked"));
    script.signal("a", &offer("offer from a"));

    client.wait_for_state("a", NegotiationState::Stable).await?;
    assert_eq!(client.transport("a").count_calls("set_remote:Answer"), 0);
    Ok(())
}

#[actix_rt::test]
async fn larger_id_yields_on_offer_collision() -> anyhow::Result<()> {
    let (client, mut script) = TestClientBuilder::new("Bob").scripted("b").await?;
    script.joined("b", "Bob", &["a", "b"]);
    client
        .wait_for_state("a", NegotiationState::OfferSent)
        .await?;
    let abandoned = client.transport("a");

    script.signal("a", &offer("colliding offer from a"));
    client.wait_for_state("a", NegotiationState::Stable).await?;

    assert_eq!(client.transports.created(&PeerId::from("a")), 2);
    eventually(|| abandoned.is_closed()).await?;
    let current = client.transport("a");
    assert_eq!(current.count_calls("create_answer"), 1);
    assert_eq!(current.count_calls("create_offer"), 0);

    let sent = script.drain_sent();
    let signals = signals_to(&sent, "a");
    let answers = signals
        .iter()
        .filter(|s| matches!(s, SignalPayload::Sdp(d) if d.kind == SdpType::Answer))
        .count();
    assert_eq!(answers, 1);
    Ok(())
}

#[actix_rt::test]
async fn smaller_id_keeps_its_offer_on_collision() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Alice").scripted("a").await?;
    script.joined("a", "Alice", &["b", "a"]);
    client
        .wait_for_state("b", NegotiationState::OfferSent)
        .await?;

    script.signal("b", &offer("colliding offer from b"));
    script.signal("b", &answer("answer from b"));
    client.wait_for_state("b", NegotiationState::Stable).await?;

    let transport = client.transport("b");
    assert_eq!(client.transports.created(&PeerId::from("b")), 1);
    assert_eq!(transport.count_calls("set_remote:Offer"), 0);
    assert_eq!(transport.count_calls("set_remote:Answer"), 1);
    Ok(())
}

#[actix_rt::test]
async fn signal_from_unknown_peer_creates_it() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Bob").scripted("b").await?;
    script.signal("stranger", &offer("hello"));
    let view = client
        .wait_for_state("stranger", NegotiationState::Stable)
        .await?;
    assert_eq!(view.peers[&PeerId::from("stranger")].display_name, "");
    within(async { client.handle.leave().await }).await?;
    Ok(())
}

#[actix_rt::test]
async fn stable_connection_answers_renegotiation() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Bob").scripted("b").await?;
    crate::helper::establish(&client, &script, "b", "a").await?;
    script.signal("a", &offer("second offer"));

    let transport = client.transport("a");
    eventually(|| transport.count_calls("create_answer") == 2).await?;
    assert_eq!(
        client.handle.view().peer_state(&PeerId::from("a")),
        Some(NegotiationState::Stable)
    );
    assert_eq!(client.transports.created(&PeerId::from("a")), 1);
    Ok(())
}
