use std::io::Write;

use anyhow::{anyhow, Result};

use crate::memory::Cell;

/// Sink for the `write` system call.
pub trait Output {
    fn write_cells(&mut self, cells: &[Cell]) -> Result<()>;
}

pub struct EmptyIO {}

impl EmptyIO {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for EmptyIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Output for EmptyIO {
    fn write_cells(&mut self, _: &[Cell]) -> Result<()> {
        Err(anyhow!("write called"))
    }
}

/// Keeps everything written, in order.
pub struct BufferedOutput {
    content: Vec<Cell>,
}

impl BufferedOutput {
    pub fn into_inner(self) -> Vec<Cell> {
        self.content
    }
    pub fn new() -> Self {
        Self {
            content: Vec::new(),
        }
    }
}

impl Default for BufferedOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl Output for BufferedOutput {
    fn write_cells(&mut self, cells: &[Cell]) -> Result<()> {
        self.content.extend_from_slice(cells);
        Ok(())
    }
}

/// Prints each written range as one space-separated line.
pub struct LineOutput<W> {
    inner: W,
}

impl<W: Write> LineOutput<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Output for LineOutput<W> {
    fn write_cells(&mut self, cells: &[Cell]) -> Result<()> {
        let line: Vec<_> = cells.iter().map(|c| c.to_string()).collect();
        writeln!(self.inner, "{}", line.join(" "))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_output() {
        let mut buf = Vec::new();
        LineOutput::new(&mut buf)
            .write_cells(&[Cell::Word(72), Cell::Word(-1)])
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "72 -1\n");
        assert!(EmptyIO::new().write_cells(&[]).is_err());
    }
}
