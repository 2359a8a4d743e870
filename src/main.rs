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

use std::{path::PathBuf, process::ExitCode};

use env_logger::Env;
use relay_send::{config::DEFAULT_CONFIG_FILE, Delivery, DeliveryConfig};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let path = config_path(std::env::args().nth(1));
    log::debug!("Reading configuration from {}", path.display());
    let config = match DeliveryConfig::from_file(&path) {
        Ok(config) => config,
        Err(err) => {
            println!("Failed to send email: {} ({})", err, err.kind());
            return ExitCode::FAILURE;
        }
    };

    match Delivery::new(config).send().await {
        Ok(delivered) => {
            if !delivered.skipped.is_empty() {
                log::warn!("{} attachment(s) skipped", delivered.skipped.len());
            }
            println!(
                "Email sent successfully! ({} recipient(s), {} attachment(s))",
                delivered.recipients, delivered.attachments
            );
            ExitCode::SUCCESS
        }
        Err(failure) => {
            println!("Failed to send email: {}", failure);
            ExitCode::FAILURE
        }
    }
}

// An explicit path is used as given. The default file is looked up in the
// working directory first, then next to the executable.
fn config_path(arg: Option<String>) -> PathBuf {
    if let Some(path) = arg {
        return PathBuf::from(path);
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.is_file() {
        return local;
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)))
        .filter(|path| path.is_file())
        .unwrap_or(local)
}
