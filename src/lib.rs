// dendrite is the client half of a topic-based RPC and pub/sub protocol.
// A process starts one I/O pool, creates clients on it, and talks to remote
// endpoints through calls (request and response), publishes (one way) and
// subscriptions (a stream of pushes until cancelled). The same surface is
// exported to C through `ffi`.

pub mod client;
pub mod ffi;
pub mod hex;
pub mod io;

pub use client::{
    Callbacks, ChannelState, Client, ClientConfig, CompletionSink, Delivery,
    Endpoint, Error, ErrorKind, Result, Subscription, SubscriptionHandlers,
    Timeout,
};
pub use io::{global_init, global_uninit, IoContext, PoolConfig};
