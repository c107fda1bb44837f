//! # Protocols
//!
//! The `Protocols` interface: installing protocol definitions that govern
//! record shapes and access rules within a tenant's data space.

mod configure;

pub use self::configure::{
    Action, ActionRule, Actor, Configure, ConfigureBuilder, ConfigureDescriptor, ConfigureReply,
    Definition, ProtocolType, RuleSet,
};
