//! Debug information: line tables and backtraces.

use std::fmt;

/// A line table entry mapping an instruction index to a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Instruction index where the line starts
    pub pc: usize,
    /// Line number (1-based)
    pub line: u32,
}

/// A line table for mapping instruction indices to source lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    entries: Vec<LineEntry>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry to the line table.
    pub fn add(&mut self, pc: usize, line: u32) {
        let at = self.entries.partition_point(|e| e.pc <= pc);
        self.entries.insert(at, LineEntry { pc, line });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Line of the entry with the largest pc <= `pc`.
    pub fn find_line(&self, pc: usize) -> Option<u32> {
        let at = self.entries.partition_point(|e| e.pc <= pc);
        at.checked_sub(1).map(|i| self.entries[i].line)
    }
}

impl FromIterator<(usize, u32)> for LineTable {
    fn from_iter<I: IntoIterator<Item = (usize, u32)>>(iter: I) -> Self {
        let mut table = LineTable::new();
        for (pc, line) in iter {
            table.add(pc, line);
        }
        table
    }
}

/// One frame of a backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackTraceElement {
    pub class: String,
    pub method: String,
    pub descriptor: String,
    pub pc: usize,
    pub line: Option<u32>,
    pub native: bool,
}

impl fmt::Display for StackTraceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class.replace('/', "."), self.method)?;
        if self.native {
            write!(f, "(Native Method)")
        } else if let Some(line) = self.line {
            write!(f, "(line {})", line)
        } else {
            write!(f, "(pc {})", self.pc)
        }
    }
}

/// A list of frames, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    pub frames: Vec<StackTraceElement>,
}

impl Backtrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, element: StackTraceElement) {
        self.frames.push(element);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StackTraceElement> {
        self.frames.iter()
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "\tat {}", frame)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_table() {
        let table: LineTable = [(0, 10), (5, 12), (3, 11)].into_iter().collect();
        assert_eq!(table.find_line(0), Some(10));
        assert_eq!(table.find_line(4), Some(11));
        assert_eq!(table.find_line(5), Some(12));
        assert_eq!(table.find_line(100), Some(12));
        assert_eq!(LineTable::new().find_line(0), None);

        let late: LineTable = [(2, 7)].into_iter().collect();
        assert_eq!(late.find_line(1), None);
    }

    #[test]
    fn test_backtrace_display() {
        let mut bt = Backtrace::new();
        bt.push(StackTraceElement {
            class: "demo/Main".to_string(),
            method: "divide".to_string(),
            descriptor: "(II)I".to_string(),
            pc: 2,
            line: Some(7),
            native: false,
        });
        bt.push(StackTraceElement {
            class: "demo/Main".to_string(),
            method: "main".to_string(),
            descriptor: "()V".to_string(),
            pc: 4,
            line: None,
            native: false,
        });
        assert_eq!(
            bt.to_string(),
            "\tat demo.Main.divide(line 7)\n\tat demo.Main.main(pc 4)\n"
        );
    }
}
