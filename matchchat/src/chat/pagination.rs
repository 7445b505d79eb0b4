//! Backward history paging with scroll-anchor preservation.
//!
//! [`PaginationController`] tracks where the loaded window starts and
//! whether anything older exists, and guards against overlapping loads.
//! [`Viewport`] holds the scroll offset the engine adjusts after a prepend
//! so content already on screen does not move.

use matchchat_proto::api::{Cursor, HistoryPage, HistoryQuery};
use matchchat_proto::message::PeerId;

/// A load that [`PaginationController::begin`] allowed to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Query to send.
    pub query: HistoryQuery,
}

/// Why [`PaginationController::begin`] refused to start a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// A load is already in flight.
    InFlight,
    /// The start of the conversation has been reached.
    Exhausted,
    /// The viewport is not close enough to the top.
    NotNearTop,
}

/// Cursor bookkeeping for one conversation.
#[derive(Debug, Clone)]
pub struct PaginationController {
    peer_id: PeerId,
    page_size: usize,
    has_more: bool,
    oldest_cursor: Option<Cursor>,
    in_flight: bool,
    /// Error of the last failed load; cleared by the next successful one.
    last_error: Option<String>,
}

impl PaginationController {
    /// Create a controller that has not loaded anything yet.
    #[must_use]
    pub fn new(peer_id: PeerId, page_size: usize) -> Self {
        Self {
            peer_id,
            page_size: page_size.max(1),
            has_more: true,
            oldest_cursor: None,
            in_flight: false,
            last_error: None,
        }
    }

    /// Whether older history may exist.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.has_more
    }

    /// Cursor of the oldest loaded page.
    #[must_use]
    pub const fn oldest_cursor(&self) -> Option<&Cursor> {
        self.oldest_cursor.as_ref()
    }

    /// Whether a load is in flight.
    #[must_use]
    pub const fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Error of the last failed load.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Items requested per page.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Claim the in-flight slot and build the next query.
    ///
    /// # Errors
    ///
    /// Returns a [`Skip`] reason, in which case no request must be made.
    pub fn begin(&mut self) -> Result<PageRequest, Skip> {
        if self.in_flight {
            return Err(Skip::InFlight);
        }
        if !self.has_more {
            return Err(Skip::Exhausted);
        }
        self.in_flight = true;
        Ok(PageRequest {
            query: HistoryQuery {
                peer_id: self.peer_id.clone(),
                limit: self.page_size,
                before_cursor: self.oldest_cursor.clone(),
            },
        })
    }

    /// Record a successful page and release the slot.
    ///
    /// A short page or a missing cursor ends paging for good.
    pub fn complete(&mut self, page: &HistoryPage) {
        self.in_flight = false;
        self.last_error = None;
        if page.items.len() < self.page_size || page.next_cursor.is_none() {
            self.has_more = false;
        }
        if page.next_cursor.is_some() {
            self.oldest_cursor.clone_from(&page.next_cursor);
        }
    }

    /// Record a failed load and release the slot. Loaded history is kept.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.in_flight = false;
        self.last_error = Some(error.into());
    }

    /// Release the slot of a load that ended without an outcome, e.g. a
    /// cancelled request. Cursor and error are untouched.
    pub fn abandon(&mut self) {
        self.in_flight = false;
    }

    /// Stop paging without a request, e.g. when the conversation is blocked.
    pub fn exhaust(&mut self) {
        self.has_more = false;
    }
}

/// Scroll position of the rendered conversation.
///
/// `scroll_offset` is the distance in pixels from the top of the loaded
/// content to the top of the visible area.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    /// Distance from the content top to the visible top.
    pub scroll_offset: f64,
}

impl Viewport {
    /// Compensate for `height` pixels of content inserted above.
    pub fn shift_for_prepend(&mut self, height: f64) {
        self.scroll_offset += height;
    }

    /// Whether the visible area is within `threshold` of the content top.
    #[must_use]
    pub fn near_top(&self, threshold: f64) -> bool {
        self.scroll_offset <= threshold
    }
}
