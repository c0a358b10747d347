use mesh_call::{
    peer::PeerTransport, testing::MockDevices, Error, NegotiationState, PeerId,
};

use crate::helper::{establish, eventually, TestClient, TestClientBuilder};

// Senders are added audio first, then video.
const VIDEO_SENDER: usize = 1;

async fn with_two_peers() -> anyhow::Result<(TestClient, mesh_call::testing::RelayScript)> {
    let (client, script) = TestClientBuilder::new("Carol").scripted("c").await?;
    script.joined("c", "Carol", &["c"]);
    establish(&client, &script, "c", "a").await?;
    establish(&client, &script, "c", "b").await?;
    Ok((client, script))
}

fn all_stable(client: &TestClient) -> bool {
    client
        .handle
        .view()
        .peers
        .values()
        .all(|p| p.state == NegotiationState::Stable)
}

#[actix_rt::test]
async fn screen_share_retargets_every_connection() -> anyhow::Result<()> {
    let (client, _script) = with_two_peers().await?;
    let camera = client.handle.view().local_preview.unwrap();
    assert_eq!(
        client.transport("a").sender_track(VIDEO_SENDER).as_deref(),
        Some(camera.id())
    );

    let report = client.handle.start_screen_share().await?;
    assert!(report.is_complete());
    assert_eq!(report.replaced.len(), 2);

    let view = client.handle.view();
    assert!(view.screen_sharing);
    let screen = view.local_preview.unwrap();
    assert_ne!(screen, camera);
    for peer in ["a", "b"] {
        let transport = client.transport(peer);
        assert_eq!(
            transport.sender_track(VIDEO_SENDER).as_deref(),
            Some(screen.id())
        );
        assert_eq!(transport.count_calls("create_offer"), 0);
    }
    assert!(all_stable(&client));

    let report = client.handle.stop_screen_share().await?;
    assert_eq!(report.replaced.len(), 2);
    assert!(screen.is_ended());
    assert_eq!(
        client.transport("b").sender_track(VIDEO_SENDER).as_deref(),
        Some(camera.id())
    );
    Ok(())
}

#[actix_rt::test]
async fn closed_connection_is_skipped_during_replacement() -> anyhow::Result<()> {
    let (client, _script) = with_two_peers().await?;
    client.transport("a").close().await?;

    let report = client.handle.start_screen_share().await?;
    assert!(report.is_complete());
    assert_eq!(report.skipped, vec![PeerId::from("a")]);
    assert_eq!(report.replaced, vec![PeerId::from("b")]);
    Ok(())
}

#[actix_rt::test]
async fn failed_replacement_is_isolated_and_reported() -> anyhow::Result<()> {
    let (client, _script) = with_two_peers().await?;
    client.transport("a").fail_replace_track();
    let camera = client.handle.view().local_preview.unwrap();

    let report = client.handle.start_screen_share().await?;
    assert_eq!(report.replaced, vec![PeerId::from("b")]);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        &report.failed[0],
        Error::TrackReplaceFailed { peer_id, .. } if peer_id.as_str() == "a"
    ));
    assert_eq!(
        client.transport("a").sender_track(VIDEO_SENDER).as_deref(),
        Some(camera.id())
    );
    assert_eq!(client.handle.view().peers.len(), 2);
    Ok(())
}

#[actix_rt::test]
async fn browser_ending_the_share_reverts_to_camera() -> anyhow::Result<()> {
    let (client, _script) = with_two_peers().await?;
    let camera = client.handle.view().local_preview.unwrap();
    client.handle.start_screen_share().await?;
    let screen = client.handle.view().local_preview.unwrap();

    screen.stop();
    let view = client.wait_for(|v| !v.screen_sharing).await?;
    assert_eq!(view.local_preview.as_ref(), Some(&camera));
    for peer in ["a", "b"] {
        let transport = client.transport(peer);
        eventually(|| transport.sender_track(VIDEO_SENDER).as_deref() == Some(camera.id()))
            .await?;
    }
    Ok(())
}

#[actix_rt::test]
async fn denied_screen_capture_keeps_the_camera() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Carol")
        .devices(MockDevices::denying_display())
        .scripted("c")
        .await?;
    establish(&client, &script, "c", "a").await?;
    let camera = client.handle.view().local_preview.unwrap();

    assert!(matches!(
        client.handle.start_screen_share().await,
        Err(Error::PermissionDenied(_))
    ));
    let view = client.handle.view();
    assert!(!view.screen_sharing);
    assert_eq!(view.local_preview, Some(camera));
    Ok(())
}

#[actix_rt::test]
async fn stop_racing_a_pending_share_is_never_lost() -> anyhow::Result<()> {
    let (client, _script) = with_two_peers().await?;
    let camera = client.handle.view().local_preview.unwrap();

    for _ in 0..20 {
        let (started, stopped) = tokio::join!(
            client.handle.start_screen_share(),
            client.handle.stop_screen_share()
        );
        started?;
        let view = client.handle.view();
        match stopped {
            Err(Error::MediaBusy) => assert!(view.screen_sharing),
            Ok(_) => assert!(!view.screen_sharing),
            Err(e) => return Err(e.into()),
        }

        client.handle.stop_screen_share().await?;
        let view = client.handle.view();
        assert!(!view.screen_sharing);
        assert_eq!(view.local_preview.as_ref(), Some(&camera));
        assert_eq!(
            client.transport("a").sender_track(VIDEO_SENDER).as_deref(),
            Some(camera.id())
        );
    }
    Ok(())
}

#[actix_rt::test]
async fn audio_toggle_never_renegotiates()-> anyhow::Result<()> {
    let (client, _script) = with_two_peers().await?;
    let mic_before = client.transport("a").sender_track(0);
    let calls_before = client.transport("a").calls().len();

    assert!(!client.handle.toggle_audio().await?);
    assert!(!client.handle.view().audio_enabled);
    assert!(all_stable(&client));
    assert!(client.handle.toggle_audio().await?);
    assert!(client.handle.view().audio_enabled);

    let transport = client.transport("a");
    assert_eq!(transport.sender_track(0), mic_before);
    assert_eq!(transport.calls().len(), calls_before);
    assert!(all_stable(&client));
    Ok(())
}

#[actix_rt::test]
async fn video_toggle_attaches_a_fresh_camera_track() -> anyhow::Result<()> {
    let (client, _script) = with_two_peers().await?;
    let old = client.handle.view().local_preview.unwrap();
    let captures = client.devices.captures();

    client.handle.toggle_video().await?;
    let view = client.handle.view();
    assert!(!view.video_enabled);
    assert!(view.local_preview.is_none());
    assert!(old.is_ended());
    assert_eq!(client.transport("a").sender_track(VIDEO_SENDER), None);

    let report = client.handle.toggle_video().await?;
    assert_eq!(report.replaced.len(), 2);
    assert_eq!(client.devices.captures(), captures + 1);
    let new = client.handle.view().local_preview.unwrap();
    assert_ne!(new, old);
    for peer in ["a", "b"] {
        let transport = client.transport(peer);
        assert_eq!(
            transport.sender_track(VIDEO_SENDER).as_deref(),
            Some(new.id())
        );
        assert_eq!(transport.count_calls("create_offer"), 0);
    }
    assert!(all_stable(&client));
    Ok(())
}

#[actix_rt::test]
async fn peers_joining_later_get_the_current_video() -> anyhow::Result<()> {
    let (client, script) = TestClientBuilder::new("Carol").scripted("c").await?;
    script.joined("c", "Carol", &["c"]);
    client.handle.start_screen_share().await?;
    let screen = client.handle.view().local_preview.unwrap();

    establish(&client, &script, "c", "a").await?;
    assert_eq!(
        client.transport("a").sender_track(VIDEO_SENDER).as_deref(),
        Some(screen.id())
    );
    Ok(())
}
