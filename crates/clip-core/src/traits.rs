//! Traits implemented by the entities that own attachments

/// Primary key type
pub type Id = i64;

/// An entity that owns one or more attachments.
///
/// The attachment asks its owner for identity (used in storage paths) and,
/// optionally, for the processing deferral capability.
pub trait AttachmentOwner: Send + Sync {
    /// Model name used for the `:class` path segment (e.g. "accounts")
    fn model_name(&self) -> &str;

    /// Primary key
    fn id(&self) -> Id;

    /// Deferral capability, if the owner has one.
    ///
    /// Owners that return `None` never defer processing.
    fn deferral(&self) -> Option<&dyn DeferProcessing> {
        None
    }
}

/// Owners that push non-original style generation to a background stage.
pub trait DeferProcessing {
    fn delay_processing(&self) -> bool;
}

/// Resolve the deferral flag of an owner, treating a missing capability as `false`
pub fn delays_processing(owner: &dyn AttachmentOwner) -> bool {
    owner.deferral().is_some_and(|d| d.delay_processing())
}
