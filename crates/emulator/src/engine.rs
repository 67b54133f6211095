//! The terminal emulation engine interface.

use std::collections::BTreeSet;

/// Default number of scrollback lines kept by an engine.
pub const DEFAULT_SCROLLBACK: usize = 9999;

/// A terminal emulation engine.
///
/// The engine owns the character grid, cursor and scrollback for one session.
/// It is driven from the multiplexer's dispatcher (via [`Emulator::feed`]) and
/// read from the presentation layer, so implementations must be `Send`; the
/// session wraps it in a mutex.
pub trait Emulator: Send {
    /// Interpret a chunk of raw bytes received from the shell.
    fn feed(&mut self, data: &[u8]);

    /// Resize the visible grid to `cols` × `rows`.
    fn resize(&mut self, cols: u16, rows: u16);

    /// Returns the cursor position as `(x, y)`, i.e. `(column, row)`.
    fn cursor(&self) -> (u16, u16);

    /// Returns the grid size as `(cols, rows)`.
    fn size(&self) -> (u16, u16);

    /// Rows changed since the last [`Emulator::take_dirty`].
    fn dirty_rows(&self) -> BTreeSet<u16>;

    /// Returns and clears the set of changed rows.
    fn take_dirty(&mut self) -> BTreeSet<u16>;

    /// Number of lines that have scrolled off the top of the grid.
    fn history_len(&self) -> usize;

    /// Plain-text contents of the visible grid, rows joined by `\n`.
    fn contents(&self) -> String;
}

impl<E: Emulator + ?Sized> Emulator for Box<E> {
    fn feed(&mut self, data: &[u8]) {
        (**self).feed(data)
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        (**self).resize(cols, rows)
    }

    fn cursor(&self) -> (u16, u16) {
        (**self).cursor()
    }

    fn size(&self) -> (u16, u16) {
        (**self).size()
    }

    fn dirty_rows(&self) -> BTreeSet<u16> {
        (**self).dirty_rows()
    }

    fn take_dirty(&mut self) -> BTreeSet<u16> {
        (**self).take_dirty()
    }

    fn history_len(&self) -> usize {
        (**self).history_len()
    }

    fn contents(&self) -> String {
        (**self).contents()
    }
}
