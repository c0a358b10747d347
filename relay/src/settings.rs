use std::env;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;

pub struct Settings {
    pub application: ApplicationSettings,
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct ApplicationSettings {
    pub port: u16,
    pub host: String,
}

impl Settings {
    /// Reads `RELAY_HOST` and `RELAY_PORT`, after loading `.env` if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let host = env::var("RELAY_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = match env::var("RELAY_PORT") {
            Ok(port) => port.parse()?,
            Err(_) => DEFAULT_PORT,
        };
        Ok(Self {
            application: ApplicationSettings { port, host },
        })
    }

    /// Loopback on a port picked by the OS.
    pub fn ephemeral() -> Self {
        Self {
            application: ApplicationSettings {
                port: 0,
                host: DEFAULT_HOST.to_string(),
            },
        }
    }
}
