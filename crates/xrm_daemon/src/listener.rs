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

//! The accept loop: one `TcpListener`, one task per accepted connection,
//! all tracked in a `JoinSet` so shutdown can wait for every session to
//! notice the grace period ending.

use std::process::exit;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::select;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::graceful_shutdown;
use crate::state::AppState;

/// The daemon's default TCP port, per the protocol's well-known listening
/// port for local clients.
pub const DEFAULT_PORT: u16 = 9763;

pub async fn run(port: u16, state: AppState) {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await.unwrap_or_else(|err| {
        error!(%addr, %err, "could not bind listening socket");
        exit(1)
    });
    info!(%addr, "listening for clients");

    let dispatcher = Arc::new(Dispatcher::new());
    let mut sessions = JoinSet::new();

    loop {
        select! {
            _ = graceful_shutdown::global_shutdown_starts() => {
                info!("shutdown started, no longer accepting new connections");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        let dispatcher = dispatcher.clone();
                        sessions.spawn(async move {
                            crate::session::handle(stream, peer, state, &dispatcher).await;
                        });
                    }
                    Err(err) => {
                        error!(%err, "failed to accept connection");
                    }
                }
            }
        }
    }

    loop {
        select! {
            _ = graceful_shutdown::global_shutdown_ends() => {
                error!("shutdown grace period elapsed with sessions still open; exiting");
                exit(1);
            }
            joined = sessions.join_next() => {
                if joined.is_none() {
                    info!("all sessions drained, exiting normally");
                    break;
                }
            }
        }
    }
}
