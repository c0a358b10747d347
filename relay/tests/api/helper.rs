use std::time::Duration;

use actix_codec::Framed;
use anyhow::{anyhow, bail};
use awc::{
    ws::{self, Codec},
    BoxedSocket,
};
use futures_util::{SinkExt as _, StreamExt as _};
use mesh_call::{ClientMessage, PeerId, ServerMessage};
use once_cell::sync::Lazy;

use relay::{application, settings::Settings};

pub const TIMEOUT: Duration = Duration::from_secs(5);

static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug")
    }
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
});

pub fn enable_tracing() {
    Lazy::force(&TRACING);
}

pub struct TestApp {
    pub address: String,
    pub port: u16,
}

impl TestApp {
    pub async fn spawn() -> Self {
        enable_tracing();
        let app = application::Application::build(Settings::ephemeral())
            .await
            .expect("Failed to build application");
        let port = app.port();
        let _ = actix_rt::spawn(app.run_until_stopped());
        Self {
            address: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Runs the relay on its own thread and actix system, for tests that
    /// block the calling thread.
    pub fn spawn_on_thread() -> Self {
        enable_tracing();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            actix_rt::System::new().block_on(async move {
                let app = application::Application::build(Settings::ephemeral())
                    .await
                    .expect("Failed to build application");
                tx.send(app.port()).expect("test gone");
                app.run_until_stopped().await
            })
        });
        let port = rx.recv_timeout(TIMEOUT).expect("relay did not start");
        Self {
            address: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn base_address(&self) -> String {
        format!("http://{}:{}", &self.address, self.port)
    }

    pub fn path(&self, path: &str) -> String {
        format!("{}/{}", &self.base_address(), path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", &self.address, self.port)
    }

    /// Opens a raw socket and reads the `Welcome` frame.
    pub async fn connect(&self) -> anyhow::Result<TestSocket> {
        let (_res, ws) = awc::Client::new()
            .ws(self.ws_url())
            .connect()
            .await
            .map_err(|e| anyhow!("Client error: {}", e))?;
        let mut socket = TestSocket {
            ws,
            id: PeerId::from(""),
        };
        match socket.recv().await? {
            ServerMessage::Welcome { id } => socket.id = id,
            other => bail!("expected Welcome, got {other:?}"),
        }
        Ok(socket)
    }

    /// Connects and joins `room`, consuming the joiner's own `PeerJoined`.
    pub async fn join(&self, room: &str, display_name: &str) -> anyhow::Result<TestSocket> {
        let mut socket = self.connect().await?;
        socket
            .send(ClientMessage::Join {
                room: room.to_string(),
                display_name: display_name.to_string(),
            })
            .await?;
        match socket.recv().await? {
            ServerMessage::PeerJoined { id, .. } if id == socket.id => Ok(socket),
            other => bail!("expected own PeerJoined, got {other:?}"),
        }
    }
}

pub struct TestSocket {
    ws: Framed<BoxedSocket, Codec>,
    pub id: PeerId,
}

impl TestSocket {
    pub async fn send(&mut self, msg: ClientMessage) -> anyhow::Result<()> {
        let text = serde_json::to_string(&msg)?;
        self.ws.send(ws::Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn signal(&mut self, target: &PeerId, payload: &str) -> anyhow::Result<()> {
        self.send(ClientMessage::Signal {
            target: target.clone(),
            payload: payload.to_string(),
        })
        .await
    }

    /// Next relay frame, skipping heartbeats.
    pub async fn recv(&mut self) -> anyhow::Result<ServerMessage> {
        loop {
            let frame = tokio::time::timeout(TIMEOUT, self.ws.next())
                .await
                .map_err(|_| anyhow!("no frame in time"))?
                .ok_or_else(|| anyhow!("socket closed"))??;
            match frame {
                ws::Frame::Text(text) => return Ok(serde_json::from_slice(&text)?),
                ws::Frame::Ping(msg) => self.ws.send(ws::Message::Pong(msg)).await?,
                ws::Frame::Close(reason) => bail!("closed by relay: {reason:?}"),
                _ => {}
            }
        }
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        self.ws.send(ws::Message::Close(None)).await?;
        Ok(())
    }
}
