/*
 * Copyright Stalwart Labs Ltd. See the COPYING
 * file at the top-level directory of this distribution.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use super::{crypto::utf16le, Error};

pub const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

pub const NEGOTIATE_MESSAGE: u32 = 1;
pub const CHALLENGE_MESSAGE: u32 = 2;
pub const AUTHENTICATE_MESSAGE: u32 = 3;

pub const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
pub const NEGOTIATE_OEM: u32 = 0x0000_0002;
pub const REQUEST_TARGET: u32 = 0x0000_0004;
pub const NEGOTIATE_NTLM: u32 = 0x0000_0200;
pub const NEGOTIATE_OEM_DOMAIN_SUPPLIED: u32 = 0x0000_1000;
pub const NEGOTIATE_OEM_WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
pub const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
pub const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
pub const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
pub const NEGOTIATE_128: u32 = 0x2000_0000;
pub const NEGOTIATE_56: u32 = 0x8000_0000;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

const NEGOTIATE_HEADER_LEN: usize = 32;
const CHALLENGE_MIN_LEN: usize = 32;
const AUTHENTICATE_HEADER_LEN: usize = 64;

/// Type 1 message. Domain and workstation names are sent in OEM form.
pub fn negotiate(flags: u32, domain: &str, workstation: &str) -> Vec<u8> {
    let mut msg = Vec::with_capacity(NEGOTIATE_HEADER_LEN + domain.len() + workstation.len());
    let mut flags = flags;
    if !domain.is_empty() {
        flags |= NEGOTIATE_OEM_DOMAIN_SUPPLIED;
    }
    if !workstation.is_empty() {
        flags |= NEGOTIATE_OEM_WORKSTATION_SUPPLIED;
    }

    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&NEGOTIATE_MESSAGE.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());

    let mut fields = FieldWriter::new(NEGOTIATE_HEADER_LEN);
    let domain = domain.to_ascii_uppercase();
    let workstation = workstation.to_ascii_uppercase();
    fields.field(&mut msg, domain.as_bytes());
    fields.field(&mut msg, workstation.as_bytes());
    fields.finish(&mut msg);

    msg
}

/// Type 2 message as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl Challenge {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < CHALLENGE_MIN_LEN {
            return Err(Error::Truncated);
        }
        if &bytes[..8] != SIGNATURE {
            return Err(Error::InvalidSignature);
        }
        let message_type = read_u32(bytes, 8)?;
        if message_type != CHALLENGE_MESSAGE {
            return Err(Error::UnexpectedMessageType(message_type));
        }

        let flags = read_u32(bytes, 20)?;
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&bytes[24..32]);

        // Target info fields are absent from old, short challenge messages.
        let target_info = if flags & NEGOTIATE_TARGET_INFO != 0 && bytes.len() >= 48 {
            read_field(bytes, 40)?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Challenge {
            flags,
            server_challenge,
            target_info,
        })
    }

    /// Server FILETIME from the MsvAvTimestamp pair, if present.
    pub fn timestamp(&self) -> Result<Option<u64>, Error> {
        let mut pos = 0;
        while pos + 4 <= self.target_info.len() {
            let id = u16::from_le_bytes([self.target_info[pos], self.target_info[pos + 1]]);
            let len =
                u16::from_le_bytes([self.target_info[pos + 2], self.target_info[pos + 3]]) as usize;
            let value = self
                .target_info
                .get(pos + 4..pos + 4 + len)
                .ok_or(Error::Truncated)?;
            match id {
                AV_EOL => break,
                AV_TIMESTAMP => {
                    let value: [u8; 8] = value.try_into().map_err(|_| Error::Truncated)?;
                    return Ok(Some(u64::from_le_bytes(value)));
                }
                _ => pos += 4 + len,
            }
        }
        Ok(None)
    }
}

/// Type 3 message contents, serialized without a version or MIC field.
pub struct Authenticate<'x> {
    pub flags: u32,
    pub lm_response: &'x [u8],
    pub nt_response: &'x [u8],
    pub domain: &'x str,
    pub username: &'x str,
    pub workstation: &'x str,
}

impl<'x> Authenticate<'x> {
    pub fn write_to_vec(&self) -> Vec<u8> {
        let encode = |value: &str| {
            if self.flags & NEGOTIATE_UNICODE != 0 {
                utf16le(value)
            } else {
                value.as_bytes().to_vec()
            }
        };
        let domain = encode(self.domain);
        let username = encode(self.username);
        let workstation = encode(self.workstation);

        let mut msg = Vec::with_capacity(
            AUTHENTICATE_HEADER_LEN
                + self.lm_response.len()
                + self.nt_response.len()
                + domain.len()
                + username.len()
                + workstation.len(),
        );
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&AUTHENTICATE_MESSAGE.to_le_bytes());

        let mut fields = FieldWriter::new(AUTHENTICATE_HEADER_LEN);
        fields.field(&mut msg, self.lm_response);
        fields.field(&mut msg, self.nt_response);
        fields.field(&mut msg, &domain);
        fields.field(&mut msg, &username);
        fields.field(&mut msg, &workstation);
        // No key exchange is negotiated, the session key is always empty.
        fields.field(&mut msg, &[]);
        msg.extend_from_slice(&self.flags.to_le_bytes());
        fields.finish(&mut msg);

        msg
    }
}

/// Writes security buffer descriptors (length, max length, offset) followed
/// by their payload once all descriptors are in place.
struct FieldWriter {
    offset: usize,
    payload: Vec<u8>,
}

impl FieldWriter {
    fn new(header_len: usize) -> Self {
        FieldWriter {
            offset: header_len,
            payload: Vec::new(),
        }
    }

    fn field(&mut self, msg: &mut Vec<u8>, value: &[u8]) {
        let len = value.len() as u16;
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&(self.offset as u32).to_le_bytes());
        self.offset += value.len();
        self.payload.extend_from_slice(value);
    }

    fn finish(self, msg: &mut Vec<u8>) {
        msg.extend_from_slice(&self.payload);
    }
}

fn read_u32(bytes: &[u8], pos: usize) -> Result<u32, Error> {
    bytes
        .get(pos..pos + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(Error::Truncated)
}

fn read_field(bytes: &[u8], pos: usize) -> Result<&[u8], Error> {
    let len = bytes
        .get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
        .ok_or(Error::Truncated)?;
    let offset = read_u32(bytes, pos + 4)? as usize;
    bytes.get(offset..offset + len).ok_or(Error::Truncated)
}
