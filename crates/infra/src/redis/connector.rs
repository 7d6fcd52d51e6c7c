use tracing::debug;

use crate::config::ClientConfig;
use crate::pool::{Connector, Pool, PoolError};

/// Pool of Redis connections.
pub type RedisPool = Pool<RedisConnector>;

/// Dials `host:port`, authenticates when a password is configured, then
/// selects the logical database.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
    password: Option<String>,
    database: i64,
}

impl RedisConnector {
    /// Build the connection factory. Does not dial.
    pub fn new(config: &ClientConfig) -> Result<Self, PoolError> {
        let client = redis::Client::open(format!("redis://{}:{}/", config.host, config.port))
            .map_err(|e| PoolError::Dial(e.to_string()))?;

        Ok(Self {
            client,
            password: config.password.clone(),
            database: config.database,
        })
    }
}

impl Connector for RedisConnector {
    type Connection = redis::Connection;

    fn connect(&self) -> Result<redis::Connection, PoolError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| PoolError::Dial(e.to_string()))?;

        if let Some(password) = &self.password {
            redis::cmd("AUTH")
                .arg(password)
                .query::<()>(&mut conn)
                .map_err(|e| PoolError::Dial(format!("AUTH failed: {e}")))?;
        }

        redis::cmd("SELECT")
            .arg(self.database)
            .query::<()>(&mut conn)
            .map_err(|e| PoolError::Dial(format!("SELECT {} failed: {e}", self.database)))?;

        debug!(database = self.database, "opened redis connection");
        Ok(conn)
    }
}

impl RedisPool {
    /// Build a pool from client configuration. No connection is opened
    /// until the first checkout.
    pub fn from_config(config: &ClientConfig) -> Result<Self, PoolError> {
        Ok(Pool::new(RedisConnector::new(config)?, config.pool_options()))
    }
}
