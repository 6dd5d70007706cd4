//! Domain layer: value objects, entities, the purchase state machine and the
//! ports the application layer drives.

pub mod customer;
pub mod event;
pub mod money;
pub mod ports;
pub mod purchase;
pub mod referral;
pub mod sync;
