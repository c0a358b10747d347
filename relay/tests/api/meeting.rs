use std::sync::Arc;

use mesh_call::{
    testing::{MockDevices, MockTransportFactory},
    ChatMessage, MeetingBuilder, MeetingCode, MeetingHandle, MeetingView, NegotiationState,
    WsConnector,
};

use crate::helper::{TestApp, TIMEOUT};

async fn join(app: &TestApp, name: &str, code: &MeetingCode) -> anyhow::Result<MeetingHandle> {
    let (handle, _session) = MeetingBuilder::new(
        name,
        Arc::new(MockDevices::default()),
        Arc::new(MockTransportFactory::default()),
    )
    .code(code.clone())
    .start(WsConnector::new(app.ws_url()))
    .await?;
    Ok(handle)
}

async fn wait_for<F>(handle: &MeetingHandle, f: F) -> anyhow::Result<MeetingView>
where
    F: FnMut(&MeetingView) -> bool,
{
    tokio::time::timeout(TIMEOUT, handle.wait_for(f))
        .await?
        .ok_or_else(|| anyhow::anyhow!("meeting ended"))
}

fn connected(view: &MeetingView) -> bool {
    view.peers.len() == 1
        && view
            .peers
            .values()
            .all(|p| p.state == NegotiationState::Stable)
}

#[actix_web::test]
async fn two_sessions_negotiate_through_the_relay() -> anyhow::Result<()> {
    let app = TestApp::spawn().await;
    let code = MeetingCode::generate();

    let alice = join(&app, "Alice", &code).await?;
    let bob = join(&app, "Bob", &code).await?;
    let view = wait_for(&alice, connected).await?;
    assert_eq!(
        view.peers.values().next().map(|p| p.display_name.as_str()),
        Some("Bob")
    );
    wait_for(&bob, connected).await?;

    bob.send_chat("hello over the wire").await?;
    let expected = vec![ChatMessage {
        sender: "Bob".to_string(),
        text: "hello over the wire".to_string(),
    }];
    let view = wait_for(&alice, |v| !v.messages.is_empty()).await?;
    assert_eq!(view.messages, expected);

    bob.leave().await;
    wait_for(&alice, |v| v.peers.is_empty()).await?;
    assert!(alice.is_active());
    alice.leave().await;
    Ok(())
}
