//! Internal tunnel endpoint: dials outbound WebSockets to one or more
//! rendezvous peers and executes the HTTP requests forwarded back.

pub mod pool;
pub mod tunnel;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::client::pool::Pool;
use crate::config::ClientConfig;
use crate::rules::Validator;

/// The internal peer. One pool of outbound tunnels per target.
pub struct Client {
    pools: Vec<Arc<Pool>>,
}

impl Client {
    /// Compile the validator, build the executing HTTP client, and start
    /// a tunnel pool per configured target.
    pub fn start(config: ClientConfig) -> Result<Self> {
        let validator = Arc::new(
            Validator::new(&config.blacklist, &config.whitelist)
                .context("unable to initialize the request validator")?,
        );

        let executor = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()
            .context("unable to build http client")?;

        info!("starting tunnel endpoint {} ({})", config.name, config.id);

        let config = Arc::new(config);
        let pools = config
            .targets
            .iter()
            .map(|target| {
                Pool::start(
                    config.clone(),
                    target.clone(),
                    validator.clone(),
                    executor.clone(),
                )
            })
            .collect();

        Ok(Self { pools })
    }

    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    /// Close every pool, which closes every tunnel.
    pub fn shutdown(&self) {
        for pool in &self.pools {
            pool.close();
        }
    }
}
