//! Resource model.
//!
//! This module provides:
//! - Resource urns
//! - Property values and their wire encoding
//! - Recorded resource state and provider references
//! - The registration stream consumed by a deployment

mod property;
mod registration;
mod state;
mod urn;

pub use property::{
    inherit_secret_outputs, map_contains_unknowns, map_from_wire, map_to_wire, merge_outputs,
    Archive, Asset, PropertyError, PropertyMap, PropertyValue, ARCHIVE_SIGNATURE,
    ASSET_SIGNATURE, SECRET_SIGNATURE, SIGNATURE_KEY, UNKNOWN_SENTINEL,
};
pub use registration::{
    ReadRegistration, Registration, RegistrationEvent, RegistrationSender, RegistrationStream,
    ResourceOptions,
};
pub use state::{ProviderReference, ResourceState};
pub use urn::{Urn, UrnError, PROVIDER_TYPE_PREFIX};
