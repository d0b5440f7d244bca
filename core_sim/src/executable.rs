use std::{io::Read, ops::Range};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::Cell;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LoadError {
    #[error("executable is missing its `[textStart, dataStart]` header")]
    MissingHeader,
    #[error("invalid section bounds: text starts at {text_start}, data at {data_start}, {len} cells in total")]
    InvalidBounds {
        text_start: i64,
        data_start: i64,
        len: usize,
    },
    #[error("cell {index} lies in the text section but is not an instruction")]
    ExpectedInstruction { index: usize },
    #[error("cell {index} lies in the data section but is not an integer")]
    ExpectedWord { index: usize },
    #[error("executable has {len} cells but memory holds only {capacity}")]
    TooLarge { len: usize, capacity: usize },
}

/// A compiled program: `[textStart, dataStart, text..., data...]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Cell>", into = "Vec<Cell>")]
pub struct Executable {
    cells: Vec<Cell>,
    text: Range<usize>,
}

impl TryFrom<Vec<Cell>> for Executable {
    type Error = LoadError;

    fn try_from(cells: Vec<Cell>) -> Result<Self, Self::Error> {
        let (text_start, data_start) = match cells.get(..2) {
            Some([Cell::Word(t), Cell::Word(d)]) => (*t, *d),
            _ => return Err(LoadError::MissingHeader),
        };
        let len = cells.len();
        let invalid = || LoadError::InvalidBounds {
            text_start,
            data_start,
            len,
        };
        let text = usize::try_from(text_start).map_err(|_| invalid())?;
        let data = usize::try_from(data_start).map_err(|_| invalid())?;
        if !(2 <= text && text <= data && data <= len) {
            return Err(invalid());
        }
        for (index, cell) in cells.iter().enumerate().skip(text) {
            match (index < data, cell) {
                (true, Cell::Word(_)) => return Err(LoadError::ExpectedInstruction { index }),
                (false, Cell::Token(_)) => return Err(LoadError::ExpectedWord { index }),
                _ => {}
            }
        }
        Ok(Self {
            cells,
            text: text..data,
        })
    }
}

impl From<Executable> for Vec<Cell> {
    fn from(e: Executable) -> Self {
        e.cells
    }
}

impl Executable {
    pub fn from_reader(r: impl Read) -> anyhow::Result<Self> {
        Ok(serde_json::from_reader(r)?)
    }
    /// lays out `text` right after the header, followed by `data`.
    pub fn from_parts<S: Into<String>>(
        text: impl IntoIterator<Item = S>,
        data: impl IntoIterator<Item = i64>,
    ) -> Self {
        let mut cells = vec![Cell::Word(2), Cell::Word(2)];
        cells.extend(text.into_iter().map(|s| Cell::Token(s.into())));
        let data_start = cells.len();
        cells[1] = Cell::Word(data_start as i64);
        cells.extend(data.into_iter().map(Cell::Word));
        Self {
            cells,
            text: 2..data_start,
        }
    }
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }
    pub fn text_range(&self) -> Range<usize> {
        self.text.clone()
    }
    pub fn len(&self) -> usize {
        self.cells.len()
    }
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
    /// instruction tokens with their addresses.
    pub fn instructions(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.text.clone().filter_map(|i| match &self.cells[i] {
            Cell::Token(t) => Some((i, t.as_str())),
            Cell::Word(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let json = r#"[2, 4, "mov rax 60", "syscall", 7, -3]"#;
        let e = Executable::from_reader(json.as_bytes()).unwrap();
        assert_eq!(e.text_range(), 2..4);
        assert_eq!(e.len(), 6);
        assert_eq!(
            e.instructions().collect::<Vec<_>>(),
            vec![(2, "mov rax 60"), (3, "syscall")]
        );
        assert_eq!(e, Executable::from_parts(["mov rax 60", "syscall"], [7, -3]));
    }

    #[test]
    fn test_rejects_bad_layout() {
        let check = |cells: Vec<Cell>| Executable::try_from(cells).unwrap_err();
        assert_eq!(check(vec![Cell::Word(2)]), LoadError::MissingHeader);
        assert!(matches!(
            check(vec![Cell::Word(3), Cell::Word(2)]),
            LoadError::InvalidBounds { .. }
        ));
        assert_eq!(
            check(vec![Cell::Word(2), Cell::Word(3), Cell::Word(1)]),
            LoadError::ExpectedInstruction { index: 2 }
        );
        assert_eq!(
            check(vec![Cell::Word(2), Cell::Word(2), Cell::Token("x".into())]),
            LoadError::ExpectedWord { index: 2 }
        );
        assert!(Executable::from_reader(r#"[2, 2, 1.5]"#.as_bytes()).is_err());
    }
}
