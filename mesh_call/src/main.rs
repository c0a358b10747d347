use std::{collections::BTreeMap, sync::Arc};

use mesh_call::{
    history::{HttpHistory, MeetingHistory},
    media::{ReplaceReport, SampleTrackDevices},
    MeetingBuilder, MeetingCode, MeetingHandle, MeetingView, NegotiationState, PeerId, RtcConfig,
    RtcTransportFactory, WsConnector,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    select,
    sync::watch,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn setup() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug")
    }
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

async fn log_changes(mut view: watch::Receiver<MeetingView>) {
    let mut seen_messages = 0;
    let mut roster: BTreeMap<PeerId, NegotiationState> = BTreeMap::new();
    while view.changed().await.is_ok() {
        let current = view.borrow_and_update().clone();
        for msg in current.messages.iter().skip(seen_messages) {
            info!(sender = %msg.sender, "{}", msg.text);
        }
        seen_messages = current.messages.len();

        let now: BTreeMap<_, _> = current
            .peers
            .iter()
            .map(|(id, peer)| (id.clone(), peer.state))
            .collect();
        if now != roster {
            info!(peers = ?now, "Roster changed");
            roster = now;
        }
        if !current.active {
            break;
        }
    }
}

fn report(report: ReplaceReport) {
    if !report.is_complete() {
        warn!(
            failed = report.failed.len(),
            "Some peers still receive the previous video track"
        );
    }
}

/// Returns `false` once the user asked to leave.
async fn command(handle: &MeetingHandle, line: &str) -> bool {
    let result = match line {
        "" => return true,
        "/audio" => handle
            .toggle_audio()
            .await
            .map(|enabled| info!(enabled, "Microphone")),
        "/video" => handle.toggle_video().await.map(report),
        "/share" => handle.start_screen_share().await.map(report),
        "/unshare" => handle.stop_screen_share().await.map(report),
        "/leave" => {
            handle.leave().await;
            return false;
        }
        text => handle.send_chat(text).await,
    };
    if let Err(e) = result {
        warn!(error = %e, "Command failed");
    }
    true
}

#[actix_rt::main]
async fn main() -> anyhow::Result<()> {
    setup();

    let mut config = RtcConfig::from_env()?;
    let mut args = std::env::args().skip(1);
    if let Some(name) = args.next() {
        config.display_name = name;
    }
    let code = args.next().map(MeetingCode::parse).transpose()?;

    let mut builder = MeetingBuilder::new(
        &config.display_name,
        Arc::new(SampleTrackDevices::default()),
        Arc::new(RtcTransportFactory::new(&config)),
    );
    if let Some(code) = code {
        builder = builder.code(code);
    }
    if let Some(history) = HttpHistory::from_config(&mut config) {
        builder = builder.history(Arc::new(history) as Arc<dyn MeetingHistory>);
    }

    let (handle, mut session) = builder.start(WsConnector::new(config.base_url())).await?;
    println!("Meeting code: {}", handle.view().meeting_code);
    actix_rt::spawn(log_changes(handle.subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !command(&handle, line.trim()).await {
                        break;
                    }
                }
                None => {
                    handle.leave().await;
                    break;
                }
            },
            result = &mut session => return Ok(result??),
        }
    }
    session.await??;
    Ok(())
}
