/// Dominant leading whitespace of a text buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indentation {
    Tabs,
    Spaces,
}

const SCAN_BYTES: usize = 10_000;
const SCAN_LINES: usize = 100;

impl Indentation {
    /// Guess from the leading whitespace of the first lines. `None` when no
    /// line is indented.
    pub fn detect(content: &[u8]) -> Option<Self> {
        let head = &content[..content.len().min(SCAN_BYTES)];
        let text = String::from_utf8_lossy(head);
        let mut tabs = 0usize;
        let mut spaces = 0usize;
        let lines = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            // Continuation lines of block comments are aligned, not indented.
            .filter(|l| !l.trim_start().starts_with('*'))
            .take(SCAN_LINES);
        for line in lines {
            for c in line.chars().take_while(|c| c.is_whitespace()) {
                match c {
                    '\t' => tabs += 1,
                    ' ' => spaces += 1,
                    _ => {}
                }
            }
        }
        if tabs == 0 && spaces == 0 {
            None
        } else if tabs * 2 > spaces {
            Some(Indentation::Tabs)
        } else {
            Some(Indentation::Spaces)
        }
    }

    /// Whether inserting `inserted` into a buffer indented like `self`
    /// looks like an editor misconfiguration.
    pub fn mismatches(self, inserted: &[u8]) -> bool {
        match self {
            Indentation::Spaces => inserted.contains(&b'\t'),
            Indentation::Tabs => inserted.windows(4).any(|w| w == b"    "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(Indentation::detect(b"fn a() {\n    x();\n    y();\n}\n"), Some(Indentation::Spaces));
        assert_eq!(Indentation::detect(b"fn a() {\n\tx();\n\ty();\n}\n"), Some(Indentation::Tabs));
        assert_eq!(Indentation::detect(b"flat\ntext\n"), None);
        assert_eq!(Indentation::detect(b""), None);
    }

    #[test]
    fn test_comment_alignment_ignored() {
        let src = b"/*\n * doc\n * more\n */\nfn a() {\n\tx();\n}\n";
        assert_eq!(Indentation::detect(src), Some(Indentation::Tabs));
    }

    #[test]
    fn test_mismatch() {
        assert!(Indentation::Spaces.mismatches(b"\tlet x = 1;"));
        assert!(!Indentation::Spaces.mismatches(b"    let x = 1;"));
        assert!(Indentation::Tabs.mismatches(b"    let x = 1;"));
        assert!(!Indentation::Tabs.mismatches(b"\tlet x = 1;"));
    }
}
