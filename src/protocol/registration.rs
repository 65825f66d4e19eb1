//! New-user registration.
//!
//! A registration first opens a temporary tunnel keyed by the server's shared
//! registration password, runs a nested login inside it to agree on a second
//! salt and IV and to carry the new user's password across, then drops the
//! tunnel without closing the raw transport and opens the permanent cipher
//! keyed by the transferred password.
//!
//! Each step consumes the previous [`Registration`] state, so a tunnel cannot be
//! used after it was torn down and the permanent cipher cannot exist before the
//! password arrived. Streams held by a state that fails are dropped, which
//! closes them.

use crate::config::TransportConfig;
use crate::core::validate::STRICT;
use crate::error::{constants, ProtocolError, Result};
use crate::identity::{Accounts, User};
use crate::protocol::handshake::{
    confirm_as_responder, derive_blocking, is_credential_failure, Channel, HandshakeOutcome,
    RawChannel,
};
use crate::protocol::magic::{
    C_CONNECT, C_NEW, FC_CONNECT, FS_CONNECT, S_CONNECT, S_NAME_TAKEN, S_NEW, SUB_NEW,
};
use crate::service::connection::Connection;
use crate::transport::cipher::{self, OpenReader, Role, Salt, SealWriter, Unclosable};
use crate::transport::{BoxReader, BoxWriter};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

/// Temporary tunnel layered over the raw halves without owning their shutdown.
type TempChannel = Channel<OpenReader<Unclosable<BoxReader>>, SealWriter<Unclosable<BoxWriter>>>;

/// What each side brings to a registration.
enum Side<'a> {
    Initiator {
        name: &'a str,
        password: &'a Zeroizing<String>,
    },
    Responder {
        accounts: &'a Accounts,
    },
}

impl Side<'_> {
    fn role(&self) -> Role {
        match self {
            Side::Initiator { .. } => Role::Initiator,
            Side::Responder { .. } => Role::Responder,
        }
    }
}

/// Registration progress.
pub(crate) enum Registration {
    /// `C_NEW` / `S_NEW` done; next the first salt and IV and the temporary cipher.
    AwaitingTempCipher {
        raw: RawChannel,
        shared: Zeroizing<String>,
    },
    /// Inside the temporary tunnel, before the nested `C_CONNECT`.
    AwaitingNestedLogin { tunnel: TempChannel },
    /// Second salt agreed; the new password crosses next.
    AwaitingPasswordTransfer { tunnel: TempChannel, salt: Salt },
    /// Password known to both sides; second IV, then the permanent cipher.
    AwaitingPermanentCipher {
        tunnel: TempChannel,
        salt: Salt,
        password: Zeroizing<String>,
    },
    /// Permanent cipher up; name and account creation remain.
    Registering {
        secure: RawChannel,
        password: Zeroizing<String>,
    },
    Established(Connection),
}

impl Registration {
    fn name(&self) -> &'static str {
        match self {
            Registration::AwaitingTempCipher { .. } => "awaiting-temp-cipher",
            Registration::AwaitingNestedLogin { .. } => "awaiting-nested-login",
            Registration::AwaitingPasswordTransfer { .. } => "awaiting-password-transfer",
            Registration::AwaitingPermanentCipher { .. } => "awaiting-permanent-cipher",
            Registration::Registering { .. } => "registering",
            Registration::Established(_) => "established",
        }
    }

    async fn advance(self, side: &Side<'_>, transport: &TransportConfig) -> Result<Registration> {
        let role = side.role();
        match self {
            Registration::AwaitingTempCipher { mut raw, shared } => {
                let salt = raw.exchange_salt(role).await?;
                let iv = raw.exchange_iv(role).await?;
                let kdf = transport.kdf;
                let (reader, writer) = raw.into_parts();
                let (reader, writer) = derive_blocking(move || {
                    cipher::open_pair(
                        shared.as_bytes(),
                        &salt,
                        &iv,
                        role,
                        &kdf,
                        Unclosable::new(reader),
                        Unclosable::new(writer),
                    )
                })
                .await?;
                Ok(Registration::AwaitingNestedLogin {
                    tunnel: Channel::new(reader, writer, transport),
                })
            }

            Registration::AwaitingNestedLogin { mut tunnel } => {
                match side {
                    Side::Initiator { .. } => {
                        tunnel.writer.write_int(C_CONNECT).await?;
                        if let Err(e) = tunnel.reader.read_int_expect(S_CONNECT, &STRICT).await {
                            return Err(if is_credential_failure(&e) {
                                ProtocolError::AuthenticationFailed(
                                    constants::ERR_BAD_CREDENTIALS.into(),
                                )
                            } else {
                                e
                            });
                        }
                    }
                    Side::Responder { .. } => {
                        tunnel.reader.read_int_expect(C_CONNECT, &STRICT).await?;
                        tunnel.writer.write_int(S_CONNECT).await?;
                    }
                }
                let salt = tunnel.exchange_salt(role).await?;
                Ok(Registration::AwaitingPasswordTransfer { tunnel, salt })
            }

            Registration::AwaitingPasswordTransfer { mut tunnel, salt } => {
                let password = match side {
                    Side::Initiator { password, .. } => {
                        tunnel.writer.write_secret(password).await?;
                        (*password).clone()
                    }
                    Side::Responder { .. } => tunnel.reader.read_secret().await?,
                };
                Ok(Registration::AwaitingPermanentCipher {
                    tunnel,
                    salt,
                    password,
                })
            }

            Registration::AwaitingPermanentCipher {
                mut tunnel,
                salt,
                password,
            } => {
                let iv = tunnel.exchange_iv(role).await?;
                // Flushes only; the raw halves stay open underneath.
                tunnel.writer.shutdown().await?;
                let (reader, writer) = tunnel.into_parts();
                let raw: RawChannel = Channel::new(
                    reader.into_inner().into_inner(),
                    writer.into_inner().into_inner(),
                    transport,
                );
                let secure = raw
                    .encrypt_with(password.clone(), salt, iv, role, transport)
                    .await?;
                Ok(Registration::Registering { secure, password })
            }

            Registration::Registering { secure, password } => match side {
                Side::Initiator { name, .. } => {
                    register_as_initiator(secure, name, password).await
                }
                Side::Responder { accounts } => {
                    register_as_responder(secure, accounts, password).await
                }
            },

            Registration::Established(connection) => Ok(Registration::Established(connection)),
        }
    }
}

async fn register_as_initiator(
    mut secure: RawChannel,
    name: &str,
    password: Zeroizing<String>,
) -> Result<Registration> {
    secure.reader.read_int_expect(SUB_NEW, &STRICT).await?;
    secure.writer.write_int(SUB_NEW).await?;
    secure.writer.write_string(name).await?;

    let verdict = match secure.reader.read_int_either(FS_CONNECT, S_NAME_TAKEN, &STRICT).await {
        Ok(verdict) => verdict,
        Err(e) if is_credential_failure(&e) => {
            return Err(ProtocolError::AuthenticationFailed(
                constants::ERR_BAD_CREDENTIALS.into(),
            ))
        }
        Err(e) => return Err(e),
    };
    if verdict == S_NAME_TAKEN {
        secure.abandon().await;
        return Err(ProtocolError::DuplicateName(name.to_owned()));
    }
    secure.writer.write_int(FC_CONNECT).await?;

    let user = Arc::new(User::new(name, password.as_str()));
    Ok(Registration::Established(Connection::socket(
        secure.reader,
        secure.writer,
        user,
        0,
    )))
}

async fn register_as_responder(
    mut secure: RawChannel,
    accounts: &Accounts,
    password: Zeroizing<String>,
) -> Result<Registration> {
    secure.writer.write_int(SUB_NEW).await?;
    secure.reader.read_int_expect(SUB_NEW, &STRICT).await?;
    let name = secure.reader.read_string().await?;

    let user = match accounts.create(&name, &password) {
        Ok(user) => user,
        Err(ProtocolError::DuplicateName(taken)) => {
            warn!(user = %taken, "Registration rejected, name taken");
            if let Err(e) = secure.writer.write_int(S_NAME_TAKEN).await {
                debug!(error = %e, "Could not report taken name");
            }
            secure.abandon().await;
            return Err(ProtocolError::DuplicateName(taken));
        }
        Err(e) => {
            secure.abandon().await;
            return Err(e);
        }
    };
    drop(password);

    // The initiator treats an unconfirmed registration as failed, so the name
    // must not stay taken.
    if let Err(e) = confirm_as_responder(&mut secure).await {
        if accounts.remove_if_same(&name, &user) {
            warn!(user = %name, error = %e, "Registration not confirmed, account withdrawn");
        }
        return Err(e);
    }
    let modifications = user.modification_count()?;
    Ok(Registration::Established(Connection::socket(
        secure.reader,
        secure.writer,
        user,
        modifications,
    )))
}

async fn drive(
    mut state: Registration,
    side: &Side<'_>,
    transport: &TransportConfig,
) -> Result<Connection> {
    loop {
        debug!(state = state.name(), role = ?side.role(), "Registration state");
        state = match state {
            Registration::Established(connection) => return Ok(connection),
            pending => pending.advance(side, transport).await?,
        };
    }
}

/// Register `name` with `password`, proving knowledge of the server's shared
/// `registration_password`.
///
/// # Errors
/// [`ProtocolError::DuplicateName`] when the name is taken;
/// [`ProtocolError::AuthenticationFailed`] when the server refuses registration
/// or holds a different registration password.
#[instrument(skip(reader, writer, registration_password, password, transport))]
pub async fn initiate(
    reader: BoxReader,
    writer: BoxWriter,
    registration_password: &str,
    name: &str,
    password: &str,
    transport: &TransportConfig,
) -> Result<Connection> {
    let mut raw: RawChannel = Channel::new(reader, writer, transport);
    raw.writer.write_int(C_NEW).await?;
    if let Err(e) = raw.reader.read_int_expect(S_NEW, &STRICT).await {
        raw.abandon().await;
        return Err(if is_credential_failure(&e) {
            ProtocolError::AuthenticationFailed(constants::ERR_REGISTRATION_DISABLED.into())
        } else {
            e
        });
    }

    let password = Zeroizing::new(password.to_owned());
    let side = Side::Initiator {
        name,
        password: &password,
    };
    let start = Registration::AwaitingTempCipher {
        raw,
        shared: Zeroizing::new(registration_password.to_owned()),
    };
    let connection = drive(start, &side, transport).await?;
    info!("Registered");
    Ok(connection)
}

/// Responder side, entered after `C_NEW` was read.
pub(crate) async fn respond(
    mut raw: RawChannel,
    accounts: &Accounts,
    shared: Zeroizing<String>,
    transport: &TransportConfig,
) -> Result<HandshakeOutcome> {
    if let Err(e) = raw.writer.write_int(S_NEW).await {
        raw.abandon().await;
        return Err(e);
    }
    let side = Side::Responder { accounts };
    let connection = drive(Registration::AwaitingTempCipher { raw, shared }, &side, transport).await?;
    info!(user = %connection.user().name(), "Accepted registration");
    Ok(HandshakeOutcome::Accepted(connection))
}
