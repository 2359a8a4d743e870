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

use des::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Des,
};
use md4::{Digest, Md4};

const LM_MAGIC: &[u8; 8] = b"KGS!@#$%";

pub(crate) fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

pub(crate) fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut secret_opad: Vec<u8> = vec![0x5c; 64];
    let mut secret_ipad: Vec<u8> = vec![0x36; 64];

    if key.len() <= 64 {
        for (pos, byte) in key.iter().enumerate() {
            secret_opad[pos] = *byte ^ 0x5c;
            secret_ipad[pos] = *byte ^ 0x36;
        }
    } else {
        for (pos, byte) in md5::compute(key).iter().enumerate() {
            secret_opad[pos] = *byte ^ 0x5c;
            secret_ipad[pos] = *byte ^ 0x36;
        }
    }

    secret_ipad.extend_from_slice(data);
    secret_opad.extend_from_slice(&md5::compute(&secret_ipad).0);

    md5::compute(&secret_opad).0
}

/// NTOWFv1: MD4 of the UTF-16LE password.
pub(crate) fn nt_hash(password: &str) -> [u8; 16] {
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&Md4::digest(utf16le(password)));
    hash
}

/// LMOWFv1: the upper-cased OEM password, padded to 14 bytes, used as two DES
/// keys over the LM magic constant.
pub(crate) fn lm_hash(password: &str) -> [u8; 16] {
    let mut key = [0u8; 14];
    for (pos, byte) in password
        .to_ascii_uppercase()
        .bytes()
        .take(key.len())
        .enumerate()
    {
        key[pos] = byte;
    }

    let mut hash = [0u8; 16];
    hash[..8].copy_from_slice(&des_encrypt(&key[..7], LM_MAGIC));
    hash[8..].copy_from_slice(&des_encrypt(&key[7..], LM_MAGIC));
    hash
}

/// NTOWFv2. The user name is upper-cased, the domain is used as given.
pub(crate) fn ntlmv2_hash(username: &str, password: &str, domain: &str) -> [u8; 16] {
    hmac_md5(
        &nt_hash(password),
        &utf16le(&format!("{}{}", username.to_uppercase(), domain)),
    )
}

/// DESL: the 16 byte key is zero padded to 21 bytes and split into three DES
/// keys, each encrypting the same 8 byte block.
pub(crate) fn desl(key: &[u8; 16], data: &[u8; 8]) -> [u8; 24] {
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(key);

    let mut response = [0u8; 24];
    for (chunk, key) in response.chunks_mut(8).zip(padded.chunks(7)) {
        chunk.copy_from_slice(&des_encrypt(key, data));
    }
    response
}

/// Encrypts one block with a 56 bit key spread over 8 bytes. Parity bits are
/// left unset, DES ignores them.
fn des_encrypt(key: &[u8], data: &[u8; 8]) -> [u8; 8] {
    let key = [
        key[0],
        (key[0] << 7) | (key[1] >> 1),
        (key[1] << 6) | (key[2] >> 2),
        (key[2] << 5) | (key[3] >> 3),
        (key[3] << 4) | (key[4] >> 4),
        (key[4] << 3) | (key[5] >> 5),
        (key[5] << 2) | (key[6] >> 6),
        key[6] << 1,
    ];

    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut block = GenericArray::clone_from_slice(data);
    cipher.encrypt_block(&mut block);

    let mut output = [0u8; 8];
    output.copy_from_slice(&block);
    output
}
