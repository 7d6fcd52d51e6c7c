use std::sync::Arc;

use anyhow::Context;

use delayer_infra::redis::RedisStore;
use delayer_infra::{ClientConfig, Promoter, PromoterConfig, Store};

fn main() -> anyhow::Result<()> {
    delayer_observability::init();

    let client_config = ClientConfig::from_env().context("invalid DELAYER_REDIS_* settings")?;
    let promoter_config =
        PromoterConfig::from_env().context("invalid DELAYER_PROMOTER_* settings")?;

    let store = Arc::new(RedisStore::connect(&client_config).context("failed to build redis store")?);

    // Fail fast on a bad address or password instead of logging every scan.
    let scheduled = store
        .scheduled_len()
        .with_context(|| format!("cannot reach redis at {}:{}", client_config.host, client_config.port))?;
    tracing::info!(
        host = %client_config.host,
        port = client_config.port,
        database = client_config.database,
        scheduled,
        "connected to redis"
    );

    let handle = Promoter::new(store)
        .spawn(promoter_config)
        .context("failed to start promoter")?;

    // Runs until the process is killed; every store transition is atomic.
    handle.join();
    Ok(())
}
