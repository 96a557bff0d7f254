//! Whiteflag blockchain relay.
//!
//! This crate implements the blockchain side of a Whiteflag gateway: it
//! listens to one or more blockchain nodes for transactions carrying a
//! Whiteflag-tagged payload, emits them as structured messages on an
//! internal receive bus, submits outbound Whiteflag messages as on-chain
//! transactions, and issues and verifies detached authentication
//! signatures bound to blockchain identities.
//!
//! # Architecture
//!
//! Each configured chain gets its own isolated pipeline hanging off one
//! [`chain::ChainContext`]:
//!
//! - [`rpc`] — typed JSON-RPC client with per-call timeouts
//! - [`listener`] — the block-iteration state machine that advances a
//!   per-chain cursor and fans transactions out in bounded batches
//! - [`sender`] — outbound transaction build/sign/submit with a
//!   deterministic receipt-resolution machine
//! - [`accounts`] — account lifecycle with private keys isolated in a
//!   separate secret store
//! - [`auth`] — JWS-based authentication signatures ([`jws`] holds the
//!   representation engine)
//!
//! Chains are driven through the [`chain::Blockchain`] capability trait
//! and collected in a [`chain::ChainRegistry`]. Decoded messages surface
//! on the [`bus::MessageBus`]; per-chain state persists through the
//! [`store::StateStore`] interface.
//!
//! # Modules
//!
//! - [`accounts`] — account lifecycle and periodic refresh
//! - [`auth`] — authentication signature issue/verify
//! - [`bus`] — the receive bus
//! - [`chain`] — capability interface, chain context, registry, node monitor
//! - [`config`] — per-chain configuration with env-resolved credentials
//! - [`crypto`] — hashing, HKDF, zeroization
//! - [`jws`] — JSON Web Signatures across compact/flattened/full forms
//! - [`listener`] — block listener state machine
//! - [`message`] — Whiteflag message and sign-payload types
//! - [`rpc`] — typed JSON-RPC client
//! - [`sender`] — transaction sender
//! - [`state`] — per-chain state model
//! - [`store`] — state-store and key-store interfaces
//! - [`util`] — encoding primitives, shutdown, tracing setup

pub mod accounts;
pub mod auth;
pub mod bus;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod jws;
pub mod listener;
pub mod message;
pub mod rpc;
pub mod sender;
pub mod state;
pub mod store;
pub mod util;
