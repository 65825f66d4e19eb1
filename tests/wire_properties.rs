//! Property-based tests for the framing and cipher layers
//!
//! These tests exercise the framed primitives over the encrypted stream pair
//! and over transports that deliver data in small pieces.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;
use secure_channel::config::KdfParams;
use secure_channel::core::validate::STRICT;
use secure_channel::core::wire::{FrameReader, FrameWriter};
use secure_channel::transport::cipher::{self, Iv, Role, Salt, IV_HALF_LEN, SALT_HALF_LEN};
use secure_channel::ProtocolError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Serves `data` at most `step` bytes per read.
struct Trickle {
    data: Vec<u8>,
    pos: usize,
    step: usize,
}

impl AsyncRead for Trickle {
    fn poll_read(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let n = self.step.min(buf.remaining()).min(self.data.len() - self.pos);
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn material(seed: u8) -> (Salt, Iv) {
    (
        Salt::from_halves(&[seed; SALT_HALF_LEN], &[seed.wrapping_add(1); SALT_HALF_LEN]),
        Iv::from_halves(&[seed; IV_HALF_LEN], &[seed.wrapping_add(2); IV_HALF_LEN]),
    )
}

async fn through_cipher(password: &str, seed: u8, text: &str) -> String {
    let (a, b) = tokio::io::duplex(8 * 1024);
    let (_ar, aw) = tokio::io::split(a);
    let (br, _bw) = tokio::io::split(b);
    let kdf = KdfParams::insecure_fast();
    let (salt, iv) = material(seed);

    let (_, sealing) =
        cipher::open_pair(password.as_bytes(), &salt, &iv, Role::Initiator, &kdf, tokio::io::empty(), aw)
            .unwrap();
    let (opening, _) =
        cipher::open_pair(password.as_bytes(), &salt, &iv, Role::Responder, &kdf, br, tokio::io::sink())
            .unwrap();

    let mut writer = FrameWriter::new(sealing);
    let mut reader = FrameReader::new(opening);
    let (written, read) = tokio::join!(writer.write_string(text), reader.read_string());
    written.unwrap();
    read.unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_string_survives_cipher(text in "\\PC{0,300}", password in "[a-z]{1,12}", seed in any::<u8>()) {
        let echoed = runtime().block_on(through_cipher(&password, seed, &text));
        prop_assert_eq!(echoed, text);
    }
}

proptest! {
    #[test]
    fn prop_read_arr_across_short_reads(data in prop::collection::vec(any::<u8>(), 1..2048), step in 1usize..17) {
        let mut reader = FrameReader::new(Trickle { data: data.clone(), pos: 0, step });
        let mut out = vec![0u8; data.len()];
        runtime().block_on(reader.read_arr(&mut out)).unwrap();
        prop_assert_eq!(out, data);
    }

    #[test]
    fn prop_read_arr_reports_missing(len in 0usize..64, extra in 1usize..64, step in 1usize..9) {
        let mut reader = FrameReader::new(Trickle { data: vec![9u8; len], pos: 0, step });
        let mut out = vec![0u8; len + extra];
        match runtime().block_on(reader.read_arr(&mut out)) {
            Err(ProtocolError::UnexpectedEof { missing }) => prop_assert_eq!(missing, extra),
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }

    #[test]
    fn prop_int_either_accepts_both(a in any::<i32>(), b in any::<i32>(), pick_a in any::<bool>()) {
        let value = if pick_a { a } else { b };
        let mut reader = FrameReader::new(Trickle { data: value.to_le_bytes().to_vec(), pos: 0, step: 4 });
        let read = runtime().block_on(reader.read_int_either(a, b, &STRICT)).unwrap();
        prop_assert_eq!(read, value);
    }
}

#[test]
fn test_int_either_mismatch_reports_both() {
    let mut reader = FrameReader::new(Trickle {
        data: 3i32.to_le_bytes().to_vec(),
        pos: 0,
        step: 1,
    });
    match runtime().block_on(reader.read_int_either(1, 2, &STRICT)) {
        Err(ProtocolError::Mismatch { actual, expected }) => {
            assert_eq!(actual, 3);
            assert_eq!(expected, vec![1, 2]);
            let message = ProtocolError::Mismatch { actual, expected }.to_string();
            assert!(message.contains('1') && message.contains('2') && message.contains('3'));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_random_payload_through_cipher() {
    use rand::RngCore;

    let mut payload = vec![0u8; 40_000];
    rand::rng().fill_bytes(&mut payload);

    let rt = runtime();
    rt.block_on(async {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let kdf = KdfParams::insecure_fast();
        let (salt, iv) = material(1);
        let (_, sealing) =
            cipher::open_pair(b"pw", &salt, &iv, Role::Initiator, &kdf, tokio::io::empty(), a).unwrap();
        let (opening, _) =
            cipher::open_pair(b"pw", &salt, &iv, Role::Responder, &kdf, b, tokio::io::sink()).unwrap();

        let mut writer = FrameWriter::new(sealing);
        let mut reader = FrameReader::new(opening);
        let mut received = vec![0u8; payload.len()];
        let (written, read) = tokio::join!(writer.write_arr(&payload), reader.read_arr(&mut received));
        written.unwrap();
        read.unwrap();
        assert_eq!(received, payload);
    });
}
