//! Hosted model integrations that implement [`crate::producer::DeltaSource`].
pub mod openai;
