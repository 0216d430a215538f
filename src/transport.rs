use std::sync::mpsc::{channel, Receiver, Sender};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Reply, Request};

/// Boundary to the unreliable network.
///
/// Sends are fire-and-forget: the network may drop, delay or duplicate
/// anything. The implementor is free to choose framing and encoding; the
/// delivery layer only requires that a request and its retransmissions
/// encode identically and that a reply carries `(client, seq)` back so
/// it can be correlated with the request it answers.
///
/// Receiving is not part of this trait. The owner runs its own receive
/// loop and feeds inbound packets to [`Dispatcher::dispatch`] or
/// [`RetryClient::deliver`].
///
/// [`Dispatcher::dispatch`]: crate::Dispatcher::dispatch
/// [`RetryClient::deliver`]: crate::RetryClient::deliver
pub trait Transport {
    type Op;
    type Ret;

    fn send_request(&self, request: &Request<Self::Op>);
    fn send_reply(&self, reply: &Reply<Self::Ret>);
}

/// Everything that crosses the wire.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<Op, R> {
    Request(Request<Op>),
    Reply(Reply<R>),
}

/// In-process transport over a std mpsc channel, for demos and tests.
///
/// The channel itself is lossless; tests inject loss, duplication and
/// delay at the receive side, which is indistinguishable from a lossy
/// wire to both endpoints.
#[derive(Clone)]
pub struct MpscTransport<Op, R> {
    channel: Sender<Packet<Op, R>>,
}

impl<Op, R> MpscTransport<Op, R> {
    pub fn new() -> (Self, Receiver<Packet<Op, R>>) {
        let (send, recv) = channel();
        (Self { channel: send }, recv)
    }

    pub fn from_sender(channel: Sender<Packet<Op, R>>) -> Self {
        Self { channel }
    }
}

impl<Op: Clone, R: Clone> Transport for MpscTransport<Op, R> {
    type Op = Op;
    type Ret = R;

    fn send_request(&self, request: &Request<Op>) {
        let _ = self.channel.send(Packet::Request(request.clone()));
    }

    fn send_reply(&self, reply: &Reply<R>) {
        let _ = self.channel.send(Packet::Reply(reply.clone()));
    }
}
