//! Line-oriented, thread-safe output for diagnostics and feedback.

use std::fmt;
use std::io::Write;

use parking_lot::Mutex;

/// A sink for lines of text. Every call produces at least one whole line.
pub trait Printer: Send + Sync {
    fn printf(&self, args: fmt::Arguments<'_>);

    /// Like [`Printer::printf`], with `prefix: ` in front.
    fn prefix_printf(&self, prefix: &str, args: fmt::Arguments<'_>);
}

/// Writes lines to an `io::Write`, appending a newline when the text has none.
pub struct WritePrinter<W> {
    inner: Mutex<W>,
}

impl<W: Write + Send> WritePrinter<W> {
    pub fn new(inner: W) -> Self {
        WritePrinter {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }

    fn emit(&self, text: &str) {
        let mut w = self.inner.lock();
        // Output is best effort: a closed stderr must not fail the caller.
        let _ = w.write_all(text.as_bytes());
        if !text.ends_with('\n') {
            let _ = w.write_all(b"\n");
        }
    }
}

impl<W: Write + Send> Printer for WritePrinter<W> {
    fn printf(&self, args: fmt::Arguments<'_>) {
        self.emit(&args.to_string());
    }

    fn prefix_printf(&self, prefix: &str, args: fmt::Arguments<'_>) {
        self.emit(&format!("{prefix}: {args}"));
    }
}

/// Collects each call as one entry, without the trailing newline.
#[derive(Default)]
pub struct FeedbackPrinter {
    lines: Mutex<Vec<String>>,
}

impl FeedbackPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// Take everything collected so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock())
    }

    fn push(&self, text: String) {
        let trimmed = text.strip_suffix('\n').map(str::to_string).unwrap_or(text);
        self.lines.lock().push(trimmed);
    }
}

impl Printer for FeedbackPrinter {
    fn printf(&self, args: fmt::Arguments<'_>) {
        self.push(args.to_string());
    }

    fn prefix_printf(&self, prefix: &str, args: fmt::Arguments<'_>) {
        self.push(format!("{prefix}: {args}"));
    }
}
