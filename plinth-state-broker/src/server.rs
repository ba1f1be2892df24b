// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::Context;
use plinth_common::SafeDisplay;
use plinth_common::tracing::init_tracing;
use plinth_state_broker::config::make_config_loader;
use plinth_state_broker::store::StateStore;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = make_config_loader()
        .load()
        .map_err(|err| anyhow::anyhow!("failed to load config: {err}"))?;
    init_tracing(&config.tracing);
    info!("starting state daemon with configuration:");
    for line in config.to_safe_string().lines() {
        info!("{line}");
    }

    let store = Arc::new(StateStore::new());
    store.start_sweeper(config.sweep_interval);

    let route = plinth_state_broker::api::route(store.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = poem::listener::TcpListener::bind(addr.clone());
    info!("listening on {addr}");

    poem::Server::new(listener)
        .run_with_graceful_shutdown(
            route,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            },
            Some(std::time::Duration::from_secs(5)),
        )
        .await
        .context("state daemon server failed")?;

    store.stop();
    Ok(())
}
