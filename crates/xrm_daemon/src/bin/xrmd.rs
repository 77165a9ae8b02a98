/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;
use xrm_daemon::cli::{Command, PARSED_COMMANDS};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match &PARSED_COMMANDS.subcommand {
        Some(Command::Version(_)) => {
            println!("xrmd {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Command::Serve(serve)) => run_serve(serve),
        None => run_serve(&xrm_daemon::cli::Serve::default()),
    }
}

#[tokio::main]
async fn run_serve(args: &xrm_daemon::cli::Serve) {
    let config_path = args.config.clone().map(PathBuf::from);
    xrm_daemon::run(args.port, config_path, !args.no_snapshot).await;
}
