use std::net::TcpListener;

use actix::{Actor, Addr};
use actix_web::{dev::Server, web, App, HttpServer};
use tracing::info;

use crate::settings::Settings;

use self::moderator::Moderator;

mod client;
pub mod moderator;
mod services;

/// The relay: one moderator shared by every HTTP worker, serving
/// `/health_check` and the `/ws` upgrade.
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    /// Binds the listener and starts the moderator. Port 0 picks a free port,
    /// reported by [`Application::port`].
    pub async fn build(settings: Settings) -> Result<Self, anyhow::Error> {
        let listen_on = format!("{}:{}", settings.application.host, settings.application.port);
        let listener = TcpListener::bind(&listen_on)?;
        let port = listener.local_addr()?.port();

        let moderator: web::Data<Addr<Moderator>> = web::Data::new(Moderator::default().start());
        let server = HttpServer::new(move || {
            App::new()
                .app_data(moderator.clone())
                .service(services::health_check)
                .service(services::ws)
        })
        .listen(listener)?
        .run();
        info!(%listen_on, port, "Relay listening");

        Ok(Self { port, server })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}
