//! NTLMv2 message construction for the `Negotiate` HTTP scheme.
//!
//! Only authentication is implemented; message sealing and signing are not,
//! so plaintext HTTP listeners need `AllowUnencrypted` or HTTPS.
#![expect(
    clippy::little_endian_bytes,
    reason = "NTLM messages are little-endian on the wire"
)]

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSION_SECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_128
    | NEGOTIATE_56;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

/// Server challenge extracted from a type 2 message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Challenge {
    flags: u32,
    server_challenge: [u8; 8],
    target_info: Vec<u8>,
}

fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let slice = bytes.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([*slice.first()?, *slice.get(1)?]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset.checked_add(4)?)?;
    let mut buf = [0_u8; 4];
    buf.copy_from_slice(slice);
    Some(u32::from_le_bytes(buf))
}

fn read_buffer(bytes: &[u8], header: usize) -> Option<&[u8]> {
    let len = usize::from(read_u16(bytes, header)?);
    let offset = usize::try_from(read_u32(bytes, header.checked_add(4)?)?).ok()?;
    bytes.get(offset..offset.checked_add(len)?)
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], String> {
    let mut mac = HmacMd5::new_from_slice(key).map_err(|err| err.to_string())?;
    for part in parts {
        mac.update(part);
    }
    let digest = mac.finalize().into_bytes();
    let mut out = [0_u8; 16];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// NT one-way function v1: MD4 of the UTF-16LE password.
pub(super) fn nt_hash(password: &str) -> [u8; 16] {
    let digest = Md4::digest(utf16le(password));
    let mut out = [0_u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// NT one-way function v2 keyed by user and domain.
pub(super) fn ntowf_v2(password: &str, user: &str, domain: &str) -> Result<[u8; 16], String> {
    let identity = utf16le(&format!("{}{domain}", user.to_uppercase()));
    hmac_md5(&nt_hash(password), &[&identity])
}

/// Builds the type 1 (negotiate) message.
pub(super) fn negotiate_message() -> Vec<u8> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1_u32.to_le_bytes());
    msg.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
    msg.extend_from_slice(&[0_u8; 16]);
    msg
}

/// Parses a type 2 (challenge) message.
pub(super) fn parse_challenge(bytes: &[u8]) -> Result<Challenge, String> {
    if bytes.get(..8) != Some(SIGNATURE.as_slice()) || read_u32(bytes, 8) != Some(2) {
        return Err(String::from("server did not return an NTLM challenge"));
    }
    let flags = read_u32(bytes, 20).ok_or("challenge is truncated")?;
    let mut server_challenge = [0_u8; 8];
    server_challenge.copy_from_slice(bytes.get(24..32).ok_or("challenge is truncated")?);
    let target_info = if bytes.len() >= 48 {
        read_buffer(bytes, 40)
            .ok_or("challenge target info is out of bounds")?
            .to_vec()
    } else {
        Vec::new()
    };
    Ok(Challenge {
        flags,
        server_challenge,
        target_info,
    })
}

fn timestamp_from(target_info: &[u8]) -> Option<[u8; 8]> {
    let mut offset = 0_usize;
    loop {
        let id = read_u16(target_info, offset)?;
        let len = usize::from(read_u16(target_info, offset.checked_add(2)?)?);
        let value_start = offset.checked_add(4)?;
        if id == AV_EOL {
            return None;
        }
        if id == AV_TIMESTAMP && len == 8 {
            let mut out = [0_u8; 8];
            out.copy_from_slice(target_info.get(value_start..value_start.checked_add(8)?)?);
            return Some(out);
        }
        offset = value_start.checked_add(len)?;
    }
}

fn filetime_now() -> [u8; 8] {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ticks = since_epoch
        .as_secs()
        .saturating_add(FILETIME_EPOCH_OFFSET)
        .saturating_mul(10_000_000)
        .saturating_add(u64::from(since_epoch.subsec_nanos() / 100));
    ticks.to_le_bytes()
}

fn push_buffer(header: &mut Vec<u8>, payload: &mut Vec<u8>, base: usize, data: &[u8]) -> Result<(), String> {
    let len = u16::try_from(data.len()).map_err(|_| String::from("NTLM field too long"))?;
    let offset = u32::try_from(base + payload.len()).map_err(|_| String::from("NTLM message too long"))?;
    header.extend_from_slice(&len.to_le_bytes());
    header.extend_from_slice(&len.to_le_bytes());
    header.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(data);
    Ok(())
}

/// Builds the type 3 (authenticate) message answering `challenge`.
pub(super) fn authenticate_message(
    user: &str,
    domain: &str,
    password: &str,
    challenge: &Challenge,
) -> Result<Vec<u8>, String> {
    let client_challenge: [u8; 8] = rand::random();
    let timestamp = timestamp_from(&challenge.target_info).unwrap_or_else(filetime_now);
    authenticate_with(user, domain, password, challenge, client_challenge, timestamp)
}

fn authenticate_with(
    user: &str,
    domain: &str,
    password: &str,
    challenge: &Challenge,
    client_challenge: [u8; 8],
    timestamp: [u8; 8],
) -> Result<Vec<u8>, String> {
    let key = ntowf_v2(password, user, domain)?;

    let mut blob = Vec::with_capacity(32 + challenge.target_info.len());
    blob.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp);
    blob.extend_from_slice(&client_challenge);
    blob.extend_from_slice(&[0, 0, 0, 0]);
    blob.extend_from_slice(&challenge.target_info);
    blob.extend_from_slice(&[0, 0, 0, 0]);

    let proof = hmac_md5(&key, &[&challenge.server_challenge, &blob])?;
    let mut nt_response = proof.to_vec();
    nt_response.extend_from_slice(&blob);

    let mut lm_response =
        hmac_md5(&key, &[&challenge.server_challenge, &client_challenge])?.to_vec();
    lm_response.extend_from_slice(&client_challenge);

    const HEADER_LEN: usize = 64;
    let mut header = Vec::with_capacity(HEADER_LEN);
    let mut payload = Vec::new();
    header.extend_from_slice(SIGNATURE);
    header.extend_from_slice(&3_u32.to_le_bytes());
    push_buffer(&mut header, &mut payload, HEADER_LEN, &lm_response)?;
    push_buffer(&mut header, &mut payload, HEADER_LEN, &nt_response)?;
    push_buffer(&mut header, &mut payload, HEADER_LEN, &utf16le(domain))?;
    push_buffer(&mut header, &mut payload, HEADER_LEN, &utf16le(user))?;
    push_buffer(&mut header, &mut payload, HEADER_LEN, &[])?;
    push_buffer(&mut header, &mut payload, HEADER_LEN, &[])?;
    let flags = (challenge.flags & CLIENT_FLAGS) | NEGOTIATE_UNICODE;
    header.extend_from_slice(&flags.to_le_bytes());
    header.extend_from_slice(&payload);
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn challenge_message(target_info: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&2_u32.to_le_bytes());
        msg.extend_from_slice(&[0, 0, 0, 0, 48, 0, 0, 0]);
        msg.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
        msg.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        msg.extend_from_slice(&[0; 8]);
        let len = u16::try_from(target_info.len()).expect("short target info");
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&48_u32.to_le_bytes());
        msg.extend_from_slice(target_info);
        msg
    }

    #[test]
    fn nt_hash_matches_reference_vector() {
        assert_eq!(hex(&nt_hash("Password")), "a4f49c406510bdcab6824ee7c30fd852");
    }

    #[test]
    fn ntowf_v2_matches_reference_vector() {
        let key = ntowf_v2("Password", "User", "Domain").expect("hmac");
        assert_eq!(hex(&key), "0c868a403bfd7a93a3001ef22ef02e3f");
    }

    #[test]
    fn negotiate_message_has_signature_and_type() {
        let msg = negotiate_message();
        assert_eq!(msg.len(), 32);
        assert_eq!(msg.get(..8), Some(SIGNATURE.as_slice()));
        assert_eq!(read_u32(&msg, 8), Some(1));
    }

    #[test]
    fn parses_challenge_and_timestamp() {
        let target_info = [
            AV_TIMESTAMP.to_le_bytes().as_slice(),
            &8_u16.to_le_bytes(),
            &[9, 9, 9, 9, 9, 9, 9, 9],
            &AV_EOL.to_le_bytes(),
            &0_u16.to_le_bytes(),
        ]
        .concat();
        let challenge = parse_challenge(&challenge_message(&target_info)).expect("challenge");
        assert_eq!(challenge.server_challenge, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(challenge.target_info, target_info);
        assert_eq!(timestamp_from(&challenge.target_info), Some([9; 8]));
    }

    #[test]
    fn rejects_non_challenge_messages() {
        assert!(parse_challenge(&negotiate_message()).is_err());
        assert!(parse_challenge(b"garbage").is_err());
    }

    #[test]
    fn authenticate_message_lays_out_buffers() {
        let challenge = parse_challenge(&challenge_message(&[0, 0, 0, 0])).expect("challenge");
        let msg = authenticate_with("user", "LAB", "pw", &challenge, [7; 8], [0; 8])
            .expect("message");
        assert_eq!(read_u32(&msg, 8), Some(3));
        assert_eq!(read_buffer(&msg, 28), Some(utf16le("LAB").as_slice()));
        assert_eq!(read_buffer(&msg, 36), Some(utf16le("user").as_slice()));
        let lm = read_buffer(&msg, 12).expect("lm response");
        assert_eq!(lm.len(), 24);
        let nt = read_buffer(&msg, 20).expect("nt response");
        assert_eq!(nt.len(), 16 + 28 + 4 + 4);
    }
}
