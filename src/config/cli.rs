//! Command line flags.
//!
//! Flags override whatever the configuration file and environment set.

use std::path::PathBuf;

use clap::Parser;

use super::Config;

#[derive(Parser, Debug, Default)]
#[command(name = "moquette")]
#[command(about = "Run executables in response to MQTT messages")]
pub struct Cli {
    /// Configuration file
    #[arg(long)]
    pub config: Option<String>,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,

    /// Broker URL, e.g. tcp://127.0.0.1:1883
    #[arg(long)]
    pub broker: Option<String>,

    /// MQTT client id
    #[arg(long = "client-id")]
    pub client_id: Option<String>,

    /// Username to authenticate with
    #[arg(long)]
    pub username: Option<String>,

    /// Password to authenticate with
    #[arg(long)]
    pub password: Option<String>,

    /// Directory holding handler executables
    #[arg(long = "conf")]
    pub routes_dir: Option<PathBuf>,

    /// File name separator standing in for '/'
    #[arg(long = "sep")]
    pub separator: Option<String>,
}

impl Cli {
    /// Apply flags that were given on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if self.debug {
            config.debug = true;
        }

        let mqtt = &mut config.messaging.mqtt;
        if let Some(broker) = &self.broker {
            mqtt.broker = broker.clone();
        }
        if let Some(client_id) = &self.client_id {
            mqtt.client_id = Some(client_id.clone());
        }
        if let Some(username) = &self.username {
            mqtt.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            mqtt.password = Some(password.clone());
        }

        if let Some(dir) = &self.routes_dir {
            config.routes.dir = dir.clone();
        }
        if let Some(separator) = &self.separator {
            config.routes.separator = separator.clone();
        }
    }
}
