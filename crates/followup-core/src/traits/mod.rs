//! Collaborator traits the scheduler talks to. Every seam is async and swappable.

pub mod delivery;
pub mod history;
pub mod linked_work;
pub mod personalizer;
pub mod subjects;

pub use delivery::{DeliveryChannel, DeliveryReceipt};
pub use history::HistorySource;
pub use linked_work::LinkedWorkLookup;
pub use personalizer::{PersonalizationRequest, Personalizer};
pub use subjects::SubjectDirectory;
