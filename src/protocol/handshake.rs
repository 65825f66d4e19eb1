//! Credential bootstrap: existing-user login and responder dispatch.
//!
//! Both peers contribute one half of a 64-byte salt and one half of a 16-byte IV,
//! responder half first. Only after both halves are known does either side
//! derive the cipher pair from the user's password; the combined values never
//! cross the wire.
//!
//! ```text
//! initiator                         responder
//!   C_CONNECT  ----------------->
//!              <-----------------  S_CONNECT
//!              <-----------------  salt half (32)
//!   salt half  ----------------->
//!              <-----------------  iv half (8)
//!   iv half    ----------------->
//!   name       ----------------->  lookup
//!   ======== cipher established on both sides ========
//!              <-----------------  FS_CONNECT
//!   FC_CONNECT ----------------->
//! ```

use crate::config::TransportConfig;
use crate::core::validate::STRICT;
use crate::core::wire::{FrameReader, FrameWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::identity::{Accounts, User};
use crate::protocol::magic::{C_CONNECT, C_NEW, FC_CONNECT, FS_CONNECT, S_CONNECT};
use crate::protocol::registration;
use crate::service::connection::Connection;
use crate::transport::cipher::{self, Iv, Role, Salt, IV_HALF_LEN, SALT_HALF_LEN};
use crate::transport::{BoxReader, BoxWriter};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

/// Progress of a login, logged at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Start,
    SaltExchange,
    IvExchange,
    Identify,
    CipherEstablished,
    Confirmed,
}

impl LoginState {
    fn enter(self, role: Role) {
        debug!(state = ?self, ?role, "Login state");
    }
}

/// Why a responder turned a peer away without treating it as a protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    UnknownUser(String),
    RegistrationDisabled,
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refusal::UnknownUser(name) => write!(f, "{}: {name}", constants::ERR_UNKNOWN_USER),
            Refusal::RegistrationDisabled => f.write_str(constants::ERR_REGISTRATION_DISABLED),
        }
    }
}

/// Result of a responder-side handshake.
#[derive(Debug)]
pub enum HandshakeOutcome {
    Accepted(Connection),
    Refused(Refusal),
}

/// A reader/writer pair being driven through a handshake.
pub(crate) struct Channel<R, W> {
    pub(crate) reader: FrameReader<R>,
    pub(crate) writer: FrameWriter<W>,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(reader: R, writer: W, transport: &TransportConfig) -> Self {
        Self {
            reader: FrameReader::with_max_string_len(reader, transport.max_string_len),
            writer: FrameWriter::new(writer),
        }
    }

    pub(crate) fn into_parts(self) -> (R, W) {
        (self.reader.into_inner(), self.writer.into_inner())
    }

    /// Shut down the writer and drop the reader; a failure is only logged
    /// since the caller is already unwinding.
    pub(crate) async fn abandon(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!(error = %e, "Error closing abandoned handshake streams");
        }
    }

    /// Exchange one `N`-byte half in protocol order; returns `(responder, initiator)`.
    async fn exchange_halves<const N: usize>(
        &mut self,
        role: Role,
    ) -> Result<(Zeroizing<[u8; N]>, Zeroizing<[u8; N]>)> {
        let ours = Zeroizing::new(cipher::random_array::<N>()?);
        match role {
            Role::Responder => {
                self.writer.write_arr(&ours[..]).await?;
                let theirs = Zeroizing::new(self.reader.read_array::<N>().await?);
                Ok((ours, theirs))
            }
            Role::Initiator => {
                let theirs = Zeroizing::new(self.reader.read_array::<N>().await?);
                self.writer.write_arr(&ours[..]).await?;
                Ok((theirs, ours))
            }
        }
    }

    pub(crate) async fn exchange_salt(&mut self, role: Role) -> Result<Salt> {
        let (responder, initiator) = self.exchange_halves::<SALT_HALF_LEN>(role).await?;
        Ok(Salt::from_halves(&responder, &initiator))
    }

    pub(crate) async fn exchange_iv(&mut self, role: Role) -> Result<Iv> {
        let (responder, initiator) = self.exchange_halves::<IV_HALF_LEN>(role).await?;
        Ok(Iv::from_halves(&responder, &initiator))
    }
}

/// Raw transport halves as handed to a handshake.
pub(crate) type RawChannel = Channel<BoxReader, BoxWriter>;

impl RawChannel {
    /// Wrap the raw halves in `user`'s cipher pair. Key stretching runs on the
    /// blocking pool.
    pub(crate) async fn encrypt_for(
        self,
        user: Arc<User>,
        salt: Salt,
        iv: Iv,
        role: Role,
        transport: &TransportConfig,
    ) -> Result<(RawChannel, u64)> {
        let kdf = transport.kdf;
        let (reader, writer) = self.into_parts();
        let (reader, writer, modifications) = derive_blocking(move || {
            user.open_cipher(&salt, &iv, role, &kdf, reader, writer)
        })
        .await?;
        let reader: BoxReader = Box::new(reader);
        let writer: BoxWriter = Box::new(writer);
        Ok((Channel::new(reader, writer, transport), modifications))
    }

    /// Wrap the raw halves in a cipher pair keyed by `password`.
    pub(crate) async fn encrypt_with(
        self,
        password: Zeroizing<String>,
        salt: Salt,
        iv: Iv,
        role: Role,
        transport: &TransportConfig,
    ) -> Result<RawChannel> {
        let kdf = transport.kdf;
        let (reader, writer) = self.into_parts();
        let (reader, writer) = derive_blocking(move || {
            cipher::open_pair(password.as_bytes(), &salt, &iv, role, &kdf, reader, writer)
        })
        .await?;
        let reader: BoxReader = Box::new(reader);
        let writer: BoxWriter = Box::new(writer);
        Ok(Channel::new(reader, writer, transport))
    }
}

/// Run a key derivation on tokio's blocking pool.
pub(crate) async fn derive_blocking<T, F>(derive: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(derive).await.map_err(|e| {
        ProtocolError::CipherFailure(format!("{}: {e}", constants::ERR_KEY_DERIVATION))
    })?
}

/// Send `FS_CONNECT`, then require `FC_CONNECT`.
pub(crate) async fn confirm_as_responder(tunnel: &mut RawChannel) -> Result<()> {
    tunnel.writer.write_int(FS_CONNECT).await?;
    tunnel.reader.read_int_expect(FC_CONNECT, &STRICT).await?;
    Ok(())
}

/// Require `FS_CONNECT`, then send `FC_CONNECT`. A decrypt failure or an early
/// end of stream while waiting means the responder derived a different key, or
/// refused the name.
pub(crate) async fn confirm_as_initiator(tunnel: &mut RawChannel) -> Result<()> {
    match tunnel.reader.read_int_expect(FS_CONNECT, &STRICT).await {
        Ok(_) => {}
        Err(e) if is_credential_failure(&e) => {
            return Err(ProtocolError::AuthenticationFailed(
                constants::ERR_BAD_CREDENTIALS.into(),
            ))
        }
        Err(e) => return Err(e),
    }
    tunnel.writer.write_int(FC_CONNECT).await
}

pub(crate) fn is_credential_failure(e: &ProtocolError) -> bool {
    match e {
        ProtocolError::UnexpectedEof { .. } => true,
        ProtocolError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

/// Log in as `user` over freshly connected raw halves.
///
/// # Errors
/// [`ProtocolError::AuthenticationFailed`] when the responder does not know the
/// user or holds a different password. Every stream opened by the attempt is
/// closed before an error returns.
#[instrument(skip_all, fields(user = %user.name()))]
pub async fn initiate_login(
    reader: BoxReader,
    writer: BoxWriter,
    user: Arc<User>,
    transport: &TransportConfig,
) -> Result<Connection> {
    let mut raw = Channel::new(reader, writer, transport);
    LoginState::Start.enter(Role::Initiator);

    let (salt, iv) = match initiator_preamble(&mut raw, &user).await {
        Ok(material) => material,
        Err(e) => {
            raw.abandon().await;
            return Err(e);
        }
    };

    let (mut tunnel, modifications) = raw
        .encrypt_for(Arc::clone(&user), salt, iv, Role::Initiator, transport)
        .await?;
    LoginState::CipherEstablished.enter(Role::Initiator);

    if let Err(e) = confirm_as_initiator(&mut tunnel).await {
        tunnel.abandon().await;
        return Err(e);
    }
    LoginState::Confirmed.enter(Role::Initiator);
    info!("Logged in");

    Ok(Connection::socket(tunnel.reader, tunnel.writer, user, modifications))
}

async fn initiator_preamble(raw: &mut RawChannel, user: &User) -> Result<(Salt, Iv)> {
    raw.writer.write_int(C_CONNECT).await?;
    raw.reader.read_int_expect(S_CONNECT, &STRICT).await?;

    LoginState::SaltExchange.enter(Role::Initiator);
    let salt = raw.exchange_salt(Role::Initiator).await?;
    LoginState::IvExchange.enter(Role::Initiator);
    let iv = raw.exchange_iv(Role::Initiator).await?;

    LoginState::Identify.enter(Role::Initiator);
    raw.writer.write_string(user.name()).await?;
    Ok((salt, iv))
}

/// Run the responder side of a handshake: dispatch on the opening marker to
/// login or registration.
#[instrument(skip_all)]
pub async fn accept(
    reader: BoxReader,
    writer: BoxWriter,
    accounts: &Accounts,
    transport: &TransportConfig,
) -> Result<HandshakeOutcome> {
    let mut raw = Channel::new(reader, writer, transport);
    let opening = match raw.reader.read_int().await {
        Ok(marker) => marker,
        Err(e) => {
            raw.abandon().await;
            return Err(e);
        }
    };

    match opening {
        C_CONNECT => respond_login(raw, accounts, transport).await,
        C_NEW => match accounts.registration_password() {
            Some(password) => {
                let password = Zeroizing::new(password.to_owned());
                registration::respond(raw, accounts, password, transport).await
            }
            None => {
                warn!("Registration requested but disabled");
                raw.abandon().await;
                Ok(HandshakeOutcome::Refused(Refusal::RegistrationDisabled))
            }
        },
        other => {
            raw.abandon().await;
            Err(ProtocolError::Mismatch {
                actual: i64::from(other),
                expected: vec![i64::from(C_CONNECT), i64::from(C_NEW)],
            })
        }
    }
}

async fn respond_login(
    mut raw: RawChannel,
    accounts: &Accounts,
    transport: &TransportConfig,
) -> Result<HandshakeOutcome> {
    LoginState::Start.enter(Role::Responder);
    let (salt, iv, name) = match responder_preamble(&mut raw).await {
        Ok(material) => material,
        Err(e) => {
            raw.abandon().await;
            return Err(e);
        }
    };

    let Some(user) = accounts.get(&name) else {
        info!(user = %name, "Refusing unknown user");
        raw.abandon().await;
        return Ok(HandshakeOutcome::Refused(Refusal::UnknownUser(name)));
    };

    let (mut tunnel, modifications) = raw
        .encrypt_for(Arc::clone(&user), salt, iv, Role::Responder, transport)
        .await?;
    LoginState::CipherEstablished.enter(Role::Responder);

    if let Err(e) = confirm_as_responder(&mut tunnel).await {
        tunnel.abandon().await;
        return Err(e);
    }
    LoginState::Confirmed.enter(Role::Responder);
    info!(user = %name, "Accepted login");

    Ok(HandshakeOutcome::Accepted(Connection::socket(
        tunnel.reader,
        tunnel.writer,
        user,
        modifications,
    )))
}

async fn responder_preamble(raw: &mut RawChannel) -> Result<(Salt, Iv, String)> {
    raw.writer.write_int(S_CONNECT).await?;

    LoginState::SaltExchange.enter(Role::Responder);
    let salt = raw.exchange_salt(Role::Responder).await?;
    LoginState::IvExchange.enter(Role::Responder);
    let iv = raw.exchange_iv(Role::Responder).await?;

    LoginState::Identify.enter(Role::Responder);
    let name = raw.reader.read_string().await?;
    Ok((salt, iv, name))
}
