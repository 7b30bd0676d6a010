//! External storage tier hooks.

use scour_core::ItemSlot;

/// Hooks into the external (disk) storage tier for items whose payload
/// lives there. The sweeper validates such items before trusting them
/// and notifies the tier when it reaps one.
pub trait ExtStorage: Send + Sync {
    /// Whether the item's descriptor still points at live storage.
    fn validate(&self, item: &ItemSlot) -> bool;

    /// The item is being reaped; drop its backing storage.
    fn delete(&self, item: &ItemSlot);
}
