//! Intent descriptors and utterance-to-skill matching.

pub mod matcher;

pub use matcher::{IntentDescriptor, IntentMatch, IntentMatcher, VocabularyEntry};
