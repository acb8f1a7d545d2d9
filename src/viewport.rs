//! Panel sizing from host layout signals.
//!
//! Pure projection: nothing here touches the connection. Missing
//! visual-viewport data falls back to the full window.

use std::time::{Duration, Instant};

pub const MOBILE_BREAKPOINT_PX: f64 = 768.0;
/// One display frame.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);
/// Shrink below this and the keyboard is treated as open.
const KEYBOARD_THRESHOLD_PX: f64 = 80.0;
const DESKTOP_PANEL_HEIGHT_PX: f64 = 600.0;
const DESKTOP_PANEL_MARGIN_PX: f64 = 96.0;

/// Raw layout signals reported by the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostLayout {
    pub window_width_px: f64,
    pub window_height_px: f64,
    /// Visual viewport, when the host exposes one.
    pub visual_height_px: Option<f64>,
    pub visual_offset_top_px: Option<f64>,
    pub user_agent: String,
    pub max_touch_points: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportSnapshot {
    pub is_mobile: bool,
    pub is_ios: bool,
    pub keyboard_offset_px: f64,
    pub viewport_height_px: f64,
}

impl Default for ViewportSnapshot {
    fn default() -> Self {
        Self {
            is_mobile: false,
            is_ios: false,
            keyboard_offset_px: 0.0,
            viewport_height_px: DESKTOP_PANEL_HEIGHT_PX + DESKTOP_PANEL_MARGIN_PX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanelBounds {
    pub height_px: f64,
    /// Distance from the layout bottom, lifts the panel above the keyboard.
    pub bottom_offset_px: f64,
    pub full_screen: bool,
}

fn finite_positive(v: f64) -> Option<f64> {
    (v.is_finite() && v > 0.0).then_some(v)
}

impl ViewportSnapshot {
    pub fn compute(layout: &HostLayout) -> Self {
        let ua = layout.user_agent.to_lowercase();
        let is_ios = ["iphone", "ipad", "ipod"].iter().any(|d| ua.contains(d))
            // iPadOS reports a desktop Safari UA but has touch points.
            || (ua.contains("macintosh") && layout.max_touch_points > 1);
        let width = finite_positive(layout.window_width_px);
        let is_mobile = is_ios
            || ua.contains("android")
            || ua.contains("mobile")
            || width.map(|w| w < MOBILE_BREAKPOINT_PX).unwrap_or(false);

        let window_height = match finite_positive(layout.window_height_px) {
            Some(h) => h,
            None => {
                return Self {
                    is_mobile,
                    is_ios,
                    ..Self::default()
                }
            }
        };

        let visual_height = layout
            .visual_height_px
            .and_then(finite_positive)
            .map(|h| h.min(window_height));
        let (viewport_height_px, keyboard_offset_px) = match visual_height {
            Some(visual) => {
                let offset_top = layout
                    .visual_offset_top_px
                    .filter(|v| v.is_finite())
                    .unwrap_or(0.0)
                    .max(0.0);
                let hidden = (window_height - visual - offset_top).max(0.0);
                let keyboard = if hidden >= KEYBOARD_THRESHOLD_PX { hidden } else { 0.0 };
                (visual, keyboard)
            }
            None => (window_height, 0.0),
        };

        Self {
            is_mobile,
            is_ios,
            keyboard_offset_px,
            viewport_height_px,
        }
    }

    pub fn keyboard_open(&self) -> bool {
        self.keyboard_offset_px > 0.0
    }

    pub fn panel_bounds(&self) -> PanelBounds {
        if self.is_mobile {
            return PanelBounds {
                height_px: self.viewport_height_px,
                bottom_offset_px: self.keyboard_offset_px,
                full_screen: true,
            };
        }
        let available = (self.viewport_height_px - DESKTOP_PANEL_MARGIN_PX).max(0.0);
        PanelBounds {
            height_px: DESKTOP_PANEL_HEIGHT_PX.min(available),
            bottom_offset_px: self.keyboard_offset_px,
            full_screen: false,
        }
    }
}

/// Coalesces layout signals to at most one recomputation per frame.
#[derive(Debug, Default)]
pub struct ViewportTracker {
    snapshot: ViewportSnapshot,
    last_computed: Option<Instant>,
    pending: Option<HostLayout>,
}

impl ViewportTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ViewportSnapshot {
        self.snapshot
    }

    /// Record a layout signal. Returns the new snapshot when it was
    /// recomputed now and changed; otherwise the signal waits for `flush`.
    pub fn on_layout(&mut self, layout: HostLayout, now: Instant) -> Option<ViewportSnapshot> {
        let due = self
            .last_computed
            .map(|t| now.saturating_duration_since(t) >= FRAME_INTERVAL)
            .unwrap_or(true);
        if !due {
            self.pending = Some(layout);
            return None;
        }
        self.pending = None;
        self.recompute(&layout, now)
    }

    /// Apply a coalesced signal once its frame has elapsed.
    pub fn flush(&mut self, now: Instant) -> Option<ViewportSnapshot> {
        let due = self
            .last_computed
            .map(|t| now.saturating_duration_since(t) >= FRAME_INTERVAL)
            .unwrap_or(true);
        if !due {
            return None;
        }
        let layout = self.pending.take()?;
        self.recompute(&layout, now)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn recompute(&mut self, layout: &HostLayout, now: Instant) -> Option<ViewportSnapshot> {
        self.last_computed = Some(now);
        let next = ViewportSnapshot::compute(layout);
        if next == self.snapshot {
            return None;
        }
        self.snapshot = next;
        Some(next)
    }
}
