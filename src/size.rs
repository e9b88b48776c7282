//! Terminal geometry

use std::fmt;

use nix::libc;

/// Character grid of a terminal, with the optional pixel size of the
/// area it is drawn in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
    /// 0 when unknown
    pub pixel_width: u16,
    /// 0 when unknown
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_pixels(cols, rows, 0, 0)
    }

    pub fn with_pixels(cols: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            cols,
            rows,
            pixel_width,
            pixel_height,
        }
    }

    /// Check that the grid holds at least one cell
    ///
    /// Returns the name of the first empty dimension. The kernel accepts a
    /// zero-sized terminal, but most programs misbehave on one.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.rows == 0 {
            return Err("rows");
        }
        if self.cols == 0 {
            return Err("columns");
        }
        Ok(())
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)?;
        if self.pixel_width != 0 || self.pixel_height != 0 {
            write!(f, " ({}x{} px)", self.pixel_width, self.pixel_height)?;
        }
        Ok(())
    }
}

impl From<WindowSize> for libc::winsize {
    fn from(size: WindowSize) -> Self {
        libc::winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.pixel_width,
            ws_ypixel: size.pixel_height,
        }
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self::with_pixels(ws.ws_col, ws.ws_row, ws.ws_xpixel, ws.ws_ypixel)
    }
}
