//! Common types used throughout Ronin

use serde::{Deserialize, Serialize};

/// Prefix marking history prompts that were sent with an image.
pub const IMAGE_PROMPT_PREFIX: &str = "(Image) ";

/// A generated visualization kept in the local history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Creation time in ms since epoch, as a string.
    pub id: String,
    pub prompt: String,
    /// Generated HTML document.
    pub code: String,
    /// ms since epoch.
    pub timestamp: u64,
}

impl HistoryItem {
    /// Whether the prompt was sent with an image.
    pub fn has_image(&self) -> bool {
        self.prompt.starts_with(IMAGE_PROMPT_PREFIX)
    }
}
