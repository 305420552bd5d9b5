// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The RPC client.

use log::*;

use crate::buffer::{FabricBuf, UniqueBuf};
use crate::completion;
use crate::connectionless::RdmCore;
use crate::fabric::{Access, Caps, MemoryRegion, PeerAddr, Provider, ProviderKind, PEER_ANY};
use crate::rpc::{self, Pack, RpcCaller};
use crate::{Error, Result, MAX_MSG_SIZE};

/// Calls functions on an [`RpcServer`](crate::rpc::RpcServer).
///
/// Every request embeds this endpoint's own address so the server can route
/// the reply without a prior handshake.
pub struct RpcClient {
    // The region must close before the buffers and the domain go away.
    _reply_mr: Box<dyn MemoryRegion>,
    core: RdmCore,
    remote: PeerAddr,
    request_buf: UniqueBuf,
    reply_buf: UniqueBuf,
}

impl RpcClient {
    pub fn new(
        provider: &dyn Provider,
        node: &str,
        port: u16,
        kind: ProviderKind,
    ) -> Result<RpcClient> {
        let core = RdmCore::open(provider, node, port, kind, false, Caps::MSG)?;

        let mut reply_buf = UniqueBuf::new();
        let reply_mr = core.register_mr(&mut reply_buf, Access::all())?;

        let dest = core
            .info
            .dest_addr
            .clone()
            .ok_or_else(|| Error::Setup("resolved info has no destination address".into()))?;
        let remote = core.av.insert(&dest)?;

        Ok(RpcClient {
            _reply_mr: reply_mr,
            core,
            remote,
            request_buf: UniqueBuf::new(),
            reply_buf,
        })
    }
}

impl RpcCaller for RpcClient {
    fn call_remote(&mut self, fn_id: u64, arg: &[u8]) -> Result<Pack> {
        let addr = self.core.ep.name()?;
        let request = rpc::encode_request(&addr, fn_id, arg)?;
        self.request_buf.copy_to(&request, 0);

        trace!("calling fn {fn_id} with {} argument bytes", arg.len());
        // SAFETY: the request buffer lives in self and is not touched until
        // the transmit completion drains below.
        unsafe {
            self.core.ep.post_send(
                self.request_buf.as_raw(),
                request.len(),
                self.request_buf.descriptor(),
                self.remote,
            )?
        };
        completion::wait_for_completion(self.core.tx_cq.as_ref())?;

        {
            let desc = self.reply_buf.descriptor();
            let raw = self.reply_buf.as_raw_mut();
            // SAFETY: the reply buffer lives in self and is not touched
            // until the receive completion drains below.
            unsafe { self.core.ep.post_recv(raw, MAX_MSG_SIZE, desc, PEER_ANY)? };
        }
        completion::wait_for_completion(self.core.rx_cq.as_ref())?;

        rpc::decode_reply(self.reply_buf.bytes())
    }
}
