//! Client entry points over TCP.

use crate::config::NetworkConfig;
use crate::error::{ProtocolError, Result};
use crate::identity::User;
use crate::protocol::{handshake, registration};
use crate::service::connection::Connection;
use crate::transport::{BoxReader, BoxWriter};
use crate::utils::timeout::with_timeout_error;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

async fn dial(config: &NetworkConfig) -> Result<(BoxReader, BoxWriter)> {
    let address = config.client.address.as_str();
    let stream = with_timeout_error(
        async { TcpStream::connect(address).await.map_err(ProtocolError::from) },
        config.client.connection_timeout,
    )
    .await?;
    stream.set_nodelay(true)?;
    debug!(peer = %address, "Connected");
    let (reader, writer) = stream.into_split();
    let reader: BoxReader = Box::new(reader);
    let writer: BoxWriter = Box::new(writer);
    Ok((reader, writer))
}

/// Connect to the configured server and log in as `user`.
#[instrument(skip_all, fields(user = %user.name(), server = %config.client.address))]
pub async fn connect(config: &NetworkConfig, user: Arc<User>) -> Result<Arc<Connection>> {
    let (reader, writer) = dial(config).await?;
    let connection = with_timeout_error(
        handshake::initiate_login(reader, writer, user, &config.transport),
        config.client.handshake_timeout,
    )
    .await?;
    Ok(Arc::new(connection))
}

/// Connect to the configured server and register a new account.
#[instrument(skip(config, registration_password, password), fields(server = %config.client.address))]
pub async fn register(
    config: &NetworkConfig,
    registration_password: &str,
    name: &str,
    password: &str,
) -> Result<Arc<Connection>> {
    let (reader, writer) = dial(config).await?;
    let connection = with_timeout_error(
        registration::initiate(
            reader,
            writer,
            registration_password,
            name,
            password,
            &config.transport,
        ),
        config.client.handshake_timeout,
    )
    .await?;
    Ok(Arc::new(connection))
}
