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

//! Base64 framing for SASL payloads carried on SMTP command lines.

use base64::{engine::general_purpose::STANDARD, Engine};

/// Encodes an authentication payload for an AUTH continuation line.
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

/// Decodes the payload of a 334 continuation reply.
///
/// Surrounding whitespace is ignored, servers commonly pad the line.
pub fn decode(text: &str) -> crate::Result<Vec<u8>> {
    STANDARD.decode(text.trim()).map_err(Into::into)
}
