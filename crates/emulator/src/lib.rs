//! # shellmux Emulator Library
//!
//! This crate defines the boundary between the session multiplexer and the
//! terminal emulation engine that interprets a shell's byte stream.
//!
//! ## Overview
//!
//! The multiplexer never parses escape sequences itself. It pushes every chunk
//! it reads from a shell into an [`Emulator`] and resizes it when the
//! presentation layer changes the window size. The presentation layer reads
//! back the cursor, the set of rows that changed since the last repaint and
//! the amount of scrollback history.
//!
//! ```text
//! ┌──────────────┐  feed / resize   ┌──────────────────┐  cursor / dirty  ┌──────────────┐
//! │  Dispatcher  │ ───────────────► │     Emulator     │ ◄─────────────── │ Presentation │
//! └──────────────┘                  └──────────────────┘                  └──────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use emulator::{Emulator, Vt100Emulator};
//!
//! let mut vt = Vt100Emulator::new(80, 24, 1000);
//! vt.feed(b"hello\r\n");
//!
//! assert_eq!(vt.cursor(), (0, 1));
//! assert!(vt.take_dirty().contains(&0));
//! assert!(vt.contents().starts_with("hello"));
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`Emulator`] trait
//! - [`vt`]: [`Vt100Emulator`], the default engine

pub mod engine;
pub mod vt;

pub use engine::{Emulator, DEFAULT_SCROLLBACK};
pub use vt::Vt100Emulator;
