// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The RPC server: a connectionless endpoint plus a function table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::*;

use crate::buffer::{FabricBuf, UniqueBuf};
use crate::completion;
use crate::connectionless::RdmCore;
use crate::fabric::{Access, Caps, MemoryRegion, Provider, ProviderKind, PEER_ANY};
use crate::rpc::{self, RpcHandler, RpcService, SHUTDOWN_FN_ID};
use crate::{Error, Result, MAX_MSG_SIZE};

/// Serves RPC requests over a connectionless endpoint.
///
/// Each request carries the caller's address; the server inserts it into its
/// address vector for the reply and removes it afterwards, so clients need
/// no prior handshake. The handler table is append-only: all registrations
/// must happen before [`RpcServer::start`].
pub struct RpcServer {
    done: Arc<AtomicBool>,
    handlers: HashMap<u64, RpcHandler>,
    // The region must close before the buffers and the domain go away.
    _request_mr: Box<dyn MemoryRegion>,
    core: RdmCore,
    request_buf: UniqueBuf,
    reply_buf: UniqueBuf,
}

impl RpcServer {
    /// Open the endpoint on `node:port` and pre-register the shutdown
    /// function under id [`SHUTDOWN_FN_ID`]: it sets the shutdown flag and
    /// echoes its argument.
    pub fn new(
        provider: &dyn Provider,
        node: &str,
        port: u16,
        kind: ProviderKind,
    ) -> Result<RpcServer> {
        let core = RdmCore::open(provider, node, port, kind, true, Caps::MSG)?;

        let mut request_buf = UniqueBuf::new();
        let request_mr = core.register_mr(&mut request_buf, Access::all())?;

        let done = Arc::new(AtomicBool::new(false));
        let mut server = RpcServer {
            done: Arc::clone(&done),
            handlers: HashMap::new(),
            _request_mr: request_mr,
            core,
            request_buf,
            reply_buf: UniqueBuf::new(),
        };

        server.register_rpc(
            SHUTDOWN_FN_ID,
            Box::new(move |arg| {
                done.store(true, Ordering::Release);
                arg.to_vec()
            }),
        );
        Ok(server)
    }

    fn serve_one(&mut self) -> Result<()> {
        {
            let desc = self.request_buf.descriptor();
            let raw = self.request_buf.as_raw_mut();
            // SAFETY: the buffer lives in self and is not touched until the
            // receive completion drains below.
            unsafe { self.core.ep.post_recv(raw, MAX_MSG_SIZE, desc, PEER_ANY)? };
        }
        completion::wait_for_completion(self.core.rx_cq.as_ref())?;

        let (client_addr, header, arg) = rpc::decode_request(self.request_buf.bytes())?;
        let peer = self.core.av.insert(client_addr)?;

        debug!("dispatching fn {}", header.fn_id);
        let handler = self
            .handlers
            .get_mut(&header.fn_id)
            .ok_or(Error::HandlerMissing(header.fn_id))?;
        let result = handler(arg);

        let reply = rpc::encode_reply(&result)?;
        self.reply_buf.copy_to(&reply, 0);

        // SAFETY: the reply buffer lives in self and is not touched until
        // the transmit completion drains below.
        unsafe {
            self.core.ep.post_send(
                self.reply_buf.as_raw(),
                reply.len(),
                self.reply_buf.descriptor(),
                peer,
            )?
        };
        completion::wait_for_completion(self.core.tx_cq.as_ref())?;

        self.core.av.remove(peer)?;
        Ok(())
    }
}

impl RpcService for RpcServer {
    fn register_rpc(&mut self, fn_id: u64, handler: RpcHandler) {
        debug!("registering rpc function {fn_id}");
        let prev = self.handlers.insert(fn_id, handler);
        assert!(prev.is_none(), "duplicate rpc function id {fn_id}");
    }

    fn start(&mut self) -> Result<()> {
        debug!("rpc server entering its serve loop");
        while !self.done.load(Ordering::Acquire) {
            self.serve_one()?;
        }
        debug!("rpc server shut down");
        Ok(())
    }
}
