//! Application layer: the reconciliation engine, the sync dispatcher and the
//! orchestrator that wires them to the provider adapters.
//!
//! The engine serializes events per purchase through `locks`; everything
//! else is shared behind `Arc` handles and safe to call concurrently.

pub mod dispatcher;
pub mod engine;
pub mod locks;
pub mod orchestrator;
