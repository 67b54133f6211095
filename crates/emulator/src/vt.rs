//! vt100-backed terminal emulation engine.

use std::collections::BTreeSet;

use vt100::Parser;

use crate::engine::Emulator;

/// Default engine: a [`vt100::Parser`] plus row-level change tracking.
///
/// vt100 does not expose damage information, so the engine keeps a copy of
/// the visible rows and diffs it after every [`Emulator::feed`]. The cursor
/// row is always reported dirty when the cursor moves so the presentation
/// layer can repaint the old and new cursor cells.
pub struct Vt100Emulator {
    parser: Parser,
    cols: u16,
    rows: u16,
    scrollback: usize,
    rows_cache: Vec<String>,
    dirty: BTreeSet<u16>,
    history: usize,
}

impl Vt100Emulator {
    /// Create an engine with a `cols` × `rows` grid keeping `scrollback`
    /// lines of history. Zero dimensions are clamped to 1.
    pub fn new(cols: u16, rows: u16, scrollback: usize) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        let parser = Parser::new(rows, cols, scrollback);
        let rows_cache = parser.screen().rows(0, cols).collect();

        Self {
            parser,
            cols,
            rows,
            scrollback,
            rows_cache,
            dirty: BTreeSet::new(),
            history: 0,
        }
    }

    /// Returns the configured scrollback capacity.
    pub fn scrollback_capacity(&self) -> usize {
        self.scrollback
    }

    /// Get the underlying screen for advanced inspection.
    pub fn screen(&self) -> &vt100::Screen {
        self.parser.screen()
    }

    fn refresh_rows(&mut self) {
        let current: Vec<String> = self.parser.screen().rows(0, self.cols).collect();
        for (index, row) in current.iter().enumerate() {
            if self.rows_cache.get(index) != Some(row) {
                self.dirty.insert(index as u16);
            }
        }
        self.rows_cache = current;
    }

    fn refresh_history(&mut self) {
        // vt100 clamps the scrollback offset to the history length.
        self.parser.set_scrollback(usize::MAX);
        self.history = self.parser.screen().scrollback();
        self.parser.set_scrollback(0);
    }
}

impl Emulator for Vt100Emulator {
    fn feed(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let (before_row, _) = self.parser.screen().cursor_position();
        self.parser.process(data);
        let (after_row, _) = self.parser.screen().cursor_position();

        self.refresh_rows();
        self.refresh_history();

        if before_row != after_row {
            self.dirty.insert(before_row);
        }
        self.dirty.insert(after_row);
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1);
        let rows = rows.max(1);
        self.parser.set_size(rows, cols);
        self.cols = cols;
        self.rows = rows;
        self.rows_cache = self.parser.screen().rows(0, cols).collect();
        self.dirty = (0..rows).collect();

        tracing::trace!(cols, rows, "Resized emulator grid");
    }

    fn cursor(&self) -> (u16, u16) {
        let (row, col) = self.parser.screen().cursor_position();
        (col, row)
    }

    fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    fn dirty_rows(&self) -> BTreeSet<u16> {
        self.dirty.clone()
    }

    fn take_dirty(&mut self) -> BTreeSet<u16> {
        std::mem::take(&mut self.dirty)
    }

    fn history_len(&self) -> usize {
        self.history
    }

    fn contents(&self) -> String {
        self.parser.screen().contents()
    }
}
