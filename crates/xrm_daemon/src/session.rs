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

//! One task per connected client. Frames are parsed with [`WireCodec`] and
//! dispatched one at a time. Any request whose parameters carry a truthy
//! `recordClientId` also carries `clientId`/`clientProcessId` alongside it;
//! the session remembers that pair so every channel, reserve, and device
//! slot the client holds is recycled the moment the socket closes, whether
//! or not the client sent `destroyContext` first. This is the same
//! parameter-driven mechanism a client uses to re-register an existing
//! client id on a fresh connection via `echoContext`, not a special case
//! tied to `createContext`'s own response.

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use xrm_core::allocator;
use xrm_proto::{verbs, Request};

use crate::codec::WireCodec;
use crate::dispatcher::Dispatcher;
use crate::state::AppState;

pub async fn handle(stream: TcpStream, peer: std::net::SocketAddr, state: AppState, dispatcher: &Dispatcher) {
    let mut framed = Framed::new(stream, WireCodec);
    let mut client_id: Option<u64> = None;
    let mut client_process_id: Option<u32> = None;

    loop {
        let envelope = match framed.next().await {
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                warn!(%peer, %err, "session framing error, closing connection");
                break;
            }
            None => break,
        };

        let request = match Request::from_envelope(&envelope) {
            Ok(r) => r,
            Err(err) => {
                warn!(%peer, %err, "malformed request envelope");
                let resp = xrm_proto::ResponseBuilder::failed("unknown", 0, err.to_string());
                if framed.send(resp).await.is_err() {
                    break;
                }
                continue;
            }
        };

        debug!(%peer, verb = %request.name, "request received");

        let response = dispatcher.dispatch(&state, &request);

        if request.bool_field("recordClientId").unwrap_or(false) {
            if let Some(id) = request.u64_field("clientId").filter(|&id| id != 0) {
                client_id = Some(id);
                client_process_id = request.u64_field("clientProcessId").map(|v| v as u32);
            }
        }

        if request.name == verbs::DESTROY_CONTEXT {
            client_id = None;
            client_process_id = None;
        }

        if framed.send(response).await.is_err() {
            warn!(%peer, "failed to write response, closing connection");
            break;
        }
    }

    if let Some(id) = client_id {
        info!(%peer, client_id = id, ?client_process_id, "connection closed, recycling client");
        let mut cat = state.catalogue.lock();
        allocator::recycle_client(&mut cat, id);
    } else {
        info!(%peer, "connection closed");
    }
}
