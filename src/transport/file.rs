//! Unidirectional, file-backed connections.
//!
//! A file has no live peer to contribute salt and IV halves, so the writer
//! generates both and stores them in the clear header:
//!
//! ```text
//! [C_CONNECT] [salt 64] [iv 16] [i32 len][owner name] [sealed chunks ...]
//! ```
//!
//! The resulting [`Connection`] is write-only (from [`create`]) or read-only
//! (from [`open`]); the missing direction is an [`Invalid`] stub, and neither
//! supports timeouts. There are no confirmation markers.

use crate::config::TransportConfig;
use crate::core::validate::STRICT;
use crate::core::wire::{FrameReader, FrameWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::identity::User;
use crate::protocol::handshake::derive_blocking;
use crate::protocol::magic::C_CONNECT;
use crate::service::connection::Connection;
use crate::transport::cipher::{self, Iv, Role, Salt, IV_HALF_LEN, SALT_HALF_LEN};
use crate::transport::{BoxReader, BoxWriter, Invalid};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

/// Create (or truncate) `path` and return a write-only connection encrypting for `user`.
#[instrument(skip(user, transport), fields(user = %user.name(), path = %path.as_ref().display()))]
pub async fn create(
    path: impl AsRef<Path>,
    user: Arc<User>,
    transport: &TransportConfig,
) -> Result<Connection> {
    let file = File::create(path.as_ref()).await?;
    let mut header = FrameWriter::new(file);

    let salt = Salt::from_halves(
        &Zeroizing::new(cipher::random_array::<SALT_HALF_LEN>()?),
        &Zeroizing::new(cipher::random_array::<SALT_HALF_LEN>()?),
    );
    let iv = Iv::from_halves(
        &Zeroizing::new(cipher::random_array::<IV_HALF_LEN>()?),
        &Zeroizing::new(cipher::random_array::<IV_HALF_LEN>()?),
    );

    header.write_int(C_CONNECT).await?;
    header.write_arr(salt.as_bytes()).await?;
    header.write_arr(iv.as_bytes()).await?;
    header.write_string(user.name()).await?;
    let file = header.into_inner();

    let kdf = transport.kdf;
    let owner = Arc::clone(&user);
    let (_, writer, modifications) = derive_blocking(move || {
        owner.open_cipher(
            &salt,
            &iv,
            Role::Initiator,
            &kdf,
            Invalid::new(constants::ERR_WRITE_ONLY),
            file,
        )
    })
    .await?;
    debug!("Created encrypted file");

    let reader: BoxReader = Box::new(Invalid::new(constants::ERR_WRITE_ONLY));
    let writer: BoxWriter = Box::new(writer);
    Ok(Connection::file(
        FrameReader::with_max_string_len(reader, transport.max_string_len),
        FrameWriter::new(writer),
        user,
        modifications,
    ))
}

/// Open a file written by [`create`] for `user` and return a read-only connection.
///
/// # Errors
/// [`ProtocolError::AuthenticationFailed`] when the file belongs to another user;
/// a header that does not start with the login marker is a
/// [`ProtocolError::Mismatch`].
#[instrument(skip(user, transport), fields(user = %user.name(), path = %path.as_ref().display()))]
pub async fn open(
    path: impl AsRef<Path>,
    user: Arc<User>,
    transport: &TransportConfig,
) -> Result<Connection> {
    let file = File::open(path.as_ref()).await?;
    let mut header = FrameReader::with_max_string_len(file, transport.max_string_len);

    header.read_int_expect(C_CONNECT, &STRICT).await?;
    let salt = Salt::from_halves(
        &Zeroizing::new(header.read_array::<SALT_HALF_LEN>().await?),
        &Zeroizing::new(header.read_array::<SALT_HALF_LEN>().await?),
    );
    let iv = Iv::from_halves(
        &Zeroizing::new(header.read_array::<IV_HALF_LEN>().await?),
        &Zeroizing::new(header.read_array::<IV_HALF_LEN>().await?),
    );
    let owner = header.read_string().await?;
    if owner != user.name() {
        return Err(ProtocolError::AuthenticationFailed(format!(
            "{}: {owner}",
            constants::ERR_FILE_OWNER
        )));
    }
    let file = header.into_inner();

    let kdf = transport.kdf;
    let reading = Arc::clone(&user);
    let (reader, _, modifications) = derive_blocking(move || {
        reading.open_cipher(
            &salt,
            &iv,
            Role::Responder,
            &kdf,
            file,
            Invalid::new(constants::ERR_READ_ONLY),
        )
    })
    .await?;
    debug!("Opened encrypted file");

    let reader: BoxReader = Box::new(reader);
    let writer: BoxWriter = Box::new(Invalid::new(constants::ERR_READ_ONLY));
    Ok(Connection::file(
        FrameReader::with_max_string_len(reader, transport.max_string_len),
        FrameWriter::new(writer),
        user,
        modifications,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::KdfParams;
    use std::time::Duration;

    fn fast() -> TransportConfig {
        TransportConfig {
            kdf: KdfParams::insecure_fast(),
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.bin");
        let user = Arc::new(User::new("ann", "pw"));

        let out = create(&path, Arc::clone(&user), &fast()).await.unwrap();
        out.write_string("hello, file").await.unwrap();
        out.write_long(-42).await.unwrap();
        out.close().await.unwrap();

        let input = open(&path, user, &fast()).await.unwrap();
        assert_eq!(input.read_string().await.unwrap(), "hello, file");
        assert_eq!(input.read_long().await.unwrap(), -42);
        input.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_directions_are_stubbed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one-way.bin");
        let user = Arc::new(User::new("ann", "pw"));

        let out = create(&path, Arc::clone(&user), &fast()).await.unwrap();
        assert!(out.read_int().await.is_err());
        out.write_int(1).await.unwrap();
        out.close().await.unwrap();

        let input = open(&path, user, &fast()).await.unwrap();
        assert!(input.write_int(2).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bin");
        let out = create(&path, Arc::new(User::new("ann", "pw")), &fast())
            .await
            .unwrap();
        assert!(matches!(
            out.set_timeout(Some(Duration::from_secs(1))),
            Err(ProtocolError::Unsupported(_))
        ));
        assert_eq!(out.timeout(), None);
    }

    #[tokio::test]
    async fn test_other_owner_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.bin");
        let out = create(&path, Arc::new(User::new("ann", "pw")), &fast())
            .await
            .unwrap();
        out.close().await.unwrap();

        let err = open(&path, Arc::new(User::new("bob", "pw")), &fast())
            .await
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[tokio::test]
    async fn test_wrong_password_fails_to_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.bin");
        let out = create(&path, Arc::new(User::new("ann", "right")), &fast())
            .await
            .unwrap();
        out.write_int(7).await.unwrap();
        out.close().await.unwrap();

        let input = open(&path, Arc::new(User::new("ann", "wrong")), &fast())
            .await
            .unwrap();
        assert!(input.read_int().await.is_err());
    }
}
