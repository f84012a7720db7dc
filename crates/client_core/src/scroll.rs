pub const DEFAULT_BOTTOM_THRESHOLD_PX: f64 = 100.0;
pub const DEFAULT_TOP_THRESHOLD_PX: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAction {
    AutoScroll,
    ShowJumpToLatest { unread: u32 },
}

/// Viewport bookkeeping for the message list. Units are whatever the renderer
/// measures in (pixels for a GUI, rows for a terminal).
#[derive(Debug, Clone)]
pub struct ScrollState {
    bottom_threshold: f64,
    top_threshold: f64,
    scroll_top: f64,
    viewport_height: f64,
    content_height: f64,
    unread: u32,
}

impl Default for ScrollState {
    fn default() -> Self {
        Self::new(DEFAULT_BOTTOM_THRESHOLD_PX, DEFAULT_TOP_THRESHOLD_PX)
    }
}

impl ScrollState {
    pub fn new(bottom_threshold: f64, top_threshold: f64) -> Self {
        Self {
            bottom_threshold,
            top_threshold,
            scroll_top: 0.0,
            viewport_height: 0.0,
            content_height: 0.0,
            unread: 0,
        }
    }

    pub fn update_viewport(&mut self, scroll_top: f64, viewport_height: f64, content_height: f64) {
        self.scroll_top = scroll_top.max(0.0);
        self.viewport_height = viewport_height.max(0.0);
        self.content_height = content_height.max(0.0);
        if self.is_near_bottom() {
            self.unread = 0;
        }
    }

    pub fn distance_from_bottom(&self) -> f64 {
        (self.content_height - self.scroll_top - self.viewport_height).max(0.0)
    }

    pub fn is_near_bottom(&self) -> bool {
        self.distance_from_bottom() <= self.bottom_threshold
    }

    /// Own sends always follow the conversation; others only when the reader
    /// is already at the bottom.
    pub fn on_new_message(&mut self, own: bool) -> ScrollAction {
        if own || self.is_near_bottom() {
            self.unread = 0;
            ScrollAction::AutoScroll
        } else {
            self.unread += 1;
            ScrollAction::ShowJumpToLatest {
                unread: self.unread,
            }
        }
    }

    /// Returns the scroll offset that shows the newest message.
    pub fn jump_to_latest(&mut self) -> f64 {
        self.unread = 0;
        self.scroll_top = (self.content_height - self.viewport_height).max(0.0);
        self.scroll_top
    }

    pub fn should_load_older(&self, has_more: bool, request_in_flight: bool) -> bool {
        has_more && !request_in_flight && self.scroll_top <= self.top_threshold
    }

    /// Keeps the first visible message in place after older history is
    /// prepended above it. Returns the new scroll offset.
    pub fn anchor_after_prepend(&mut self, old_content_height: f64, new_content_height: f64) -> f64 {
        let grown = (new_content_height - old_content_height).max(0.0);
        self.content_height = new_content_height.max(0.0);
        self.scroll_top += grown;
        self.scroll_top
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    pub fn scroll_top(&self) -> f64 {
        self.scroll_top
    }
}

#[cfg(test)]
#[path = "tests/scroll_tests.rs"]
mod tests;
