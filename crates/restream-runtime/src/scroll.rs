//! Auto-follow policy for the timeline view.
//!
//! The coordinator only makes decisions; the rendering layer applies them.

use restream_protocol::ScrollDecision;

/// Distance from the bottom that still counts as "at the bottom".
pub const DEFAULT_SCROLL_TOLERANCE: u32 = 10;

/// A scroll notification from the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollPosition {
    pub offset: u32,
    pub viewport_height: u32,
    pub content_height: u32,
}

impl ScrollPosition {
    pub fn distance_from_bottom(&self) -> u32 {
        self.content_height
            .saturating_sub(self.viewport_height)
            .saturating_sub(self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollCoordinator {
    auto_follow: bool,
    expanded: bool,
    saved_offset: u32,
    tolerance: u32,
}

impl Default for ScrollCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLL_TOLERANCE)
    }
}

impl ScrollCoordinator {
    pub fn new(tolerance: u32) -> Self {
        Self {
            auto_follow: true,
            expanded: true,
            saved_offset: 0,
            tolerance,
        }
    }

    pub fn auto_follow(&self) -> bool {
        self.auto_follow
    }

    pub fn expanded(&self) -> bool {
        self.expanded
    }

    pub fn saved_offset(&self) -> u32 {
        self.saved_offset
    }

    pub fn on_append(&mut self) -> ScrollDecision {
        if self.expanded && self.auto_follow {
            ScrollDecision::ScrollToBottom
        } else {
            ScrollDecision::Stay
        }
    }

    /// Record a user scroll. Returns the resulting auto-follow flag.
    pub fn on_user_scroll(&mut self, position: ScrollPosition) -> bool {
        self.saved_offset = position.offset;
        self.auto_follow = position.distance_from_bottom() <= self.tolerance;
        self.auto_follow
    }

    /// Collapse or expand the panel.
    pub fn on_visibility(&mut self, expanded: bool) -> ScrollDecision {
        let was_expanded = std::mem::replace(&mut self.expanded, expanded);
        if !expanded || was_expanded {
            return ScrollDecision::Stay;
        }
        if self.auto_follow {
            ScrollDecision::ScrollToBottom
        } else {
            ScrollDecision::RestoreOffset {
                offset: self.saved_offset,
            }
        }
    }
}
