use mesh_call::{ClientMessage, ServerMessage};

use crate::helper::TestApp;

#[actix_web::test]
async fn join_broadcasts_roster_in_join_order() -> anyhow::Result<()> {
    let app = TestApp::spawn().await;
    let mut alice = app.connect().await?;
    alice
        .send(ClientMessage::Join {
            room: "r".to_string(),
            display_name: "Alice".to_string(),
        })
        .await?;
    assert_eq!(
        alice.recv().await?,
        ServerMessage::PeerJoined {
            id: alice.id.clone(),
            display_name: "Alice".to_string(),
            peers: vec![alice.id.clone()],
        }
    );

    let bob = app.join("r", "Bob").await?;
    let expected = ServerMessage::PeerJoined {
        id: bob.id.clone(),
        display_name: "Bob".to_string(),
        peers: vec![alice.id.clone(), bob.id.clone()],
    };
    assert_eq!(alice.recv().await?, expected);
    Ok(())
}

#[actix_web::test]
async fn signal_reaches_only_its_target_in_the_same_room() -> anyhow::Result<()> {
    let app = TestApp::spawn().await;
    let mut alice = app.join("r", "Alice").await?;
    let mut bob = app.join("r", "Bob").await?;
    let mut carol = app.join("s", "Carol").await?;
    // Bob joining
    alice.recv().await?;

    alice.signal(&carol.id, "lost").await?;
    alice.signal(&bob.id, r#"{"ice":{"candidate":"c"}}"#).await?;
    assert_eq!(
        bob.recv().await?,
        ServerMessage::Signal {
            from: alice.id.clone(),
            payload: r#"{"ice":{"candidate":"c"}}"#.to_string(),
        }
    );

    carol
        .send(ClientMessage::Chat {
            text: "anyone?".to_string(),
        })
        .await?;
    assert_eq!(
        carol.recv().await?,
        ServerMessage::Chat {
            sender: "Carol".to_string(),
            text: "anyone?".to_string(),
        }
    );
    Ok(())
}

#[actix_web::test]
async fn chat_is_broadcast_with_display_name() -> anyhow::Result<()> {
    let app = TestApp::spawn().await;
    let mut alice = app.join("r", "Alice").await?;
    let mut bob = app.join("r", "Bob").await?;
    alice.recv().await?;

    bob.send(ClientMessage::Chat {
        text: "hi".to_string(),
    })
    .await?;
    let expected = ServerMessage::Chat {
        sender: "Bob".to_string(),
        text: "hi".to_string(),
    };
    assert_eq!(alice.recv().await?, expected);
    assert_eq!(bob.recv().await?, expected);
    Ok(())
}

#[actix_web::test]
async fn closing_a_socket_announces_the_leave() -> anyhow::Result<()> {
    let app = TestApp::spawn().await;
    let mut alice = app.join("r", "Alice").await?;
    let bob = app.join("r", "Bob").await?;
    alice.recv().await?;

    let bob_id = bob.id.clone();
    bob.close().await?;
    assert_eq!(alice.recv().await?, ServerMessage::PeerLeft { id: bob_id });
    Ok(())
}

#[actix_web::test]
async fn second_join_and_garbage_are_ignored() -> anyhow::Result<()> {
    let app = TestApp::spawn().await;
    let mut alice = app.join("r", "Alice").await?;
    alice
        .send(ClientMessage::Join {
            room: "elsewhere".to_string(),
            display_name: "Alice".to_string(),
        })
        .await?;
    alice.signal(&"nobody".into(), "{}").await?;

    let bob = app.join("r", "Bob").await?;
    assert_eq!(
        alice.recv().await?,
        ServerMessage::PeerJoined {
            id: bob.id.clone(),
            display_name: "Bob".to_string(),
            peers: vec![alice.id.clone(), bob.id.clone()],
        }
    );
    Ok(())
}
