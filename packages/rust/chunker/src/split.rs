//! Recursive character splitter.
//!
//! Text is cut at the coarsest separator that occurs in it; pieces still longer than the
//! target are split again with the finer separators, and pieces with no separator left are
//! cut by character count. Adjacent small pieces are then merged back up to the target,
//! carrying a tail of the previous chunk forward as overlap. Lengths are counted in chars.

use std::collections::VecDeque;

pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "; ", ", ", " "];

#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl TextSplitter {
    /// `chunk_overlap` is clamped below `chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            separators: DEFAULT_SEPARATORS.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    pub fn with_separators<I, S>(mut self, separators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.separators = separators
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.is_empty())
            .collect();
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split `text` into trimmed, non-empty pieces of at most `chunk_size` chars.
    pub fn split(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.split_into(text, &self.separators, &mut out);
        out.into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn split_into(&self, text: &str, separators: &[String], out: &mut Vec<String>) {
        if char_len(text) <= self.chunk_size {
            out.push(text.to_string());
            return;
        }

        let Some(i) = separators.iter().position(|s| text.contains(s.as_str())) else {
            self.hard_cut(text, out);
            return;
        };
        let finer = &separators[i + 1..];

        let mut fitting: Vec<&str> = Vec::new();
        for piece in text.split_inclusive(separators[i].as_str()) {
            if char_len(piece) <= self.chunk_size {
                fitting.push(piece);
            } else {
                if !fitting.is_empty() {
                    self.merge(&fitting, out);
                    fitting.clear();
                }
                self.split_into(piece, finer, out);
            }
        }
        if !fitting.is_empty() {
            self.merge(&fitting, out);
        }
    }

    fn merge(&self, pieces: &[&str], out: &mut Vec<String>) {
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0;

        for piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !window.is_empty() {
                out.push(window.iter().copied().collect());
                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    let Some(front) = window.pop_front() else {
                        break;
                    };
                    total -= char_len(front);
                }
            }
            window.push_back(piece);
            total += len;
        }

        if !window.is_empty() {
            out.push(window.iter().copied().collect());
        }
    }

    fn hard_cut(&self, text: &str, out: &mut Vec<String>) {
        let chars: Vec<char> = text.chars().collect();
        let step = self.chunk_size - self.chunk_overlap;
        let mut start = 0;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            out.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
    }
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self::new(900, 150)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_piece() {
        let s = TextSplitter::default();
        assert_eq!(s.split("  Curto.  "), vec!["Curto."]);
        assert!(s.split("   ").is_empty());
    }

    #[test]
    fn merges_with_overlap() {
        let s = TextSplitter::new(20, 8);
        let pieces = s.split("aaaa bbbb cccc dddd eeee ffff");
        assert_eq!(pieces, vec!["aaaa bbbb cccc dddd", "dddd eeee ffff"]);
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let para = "Frase de exemplo sobre o edital. ".repeat(10);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let s = TextSplitter::new(400, 50);
        let pieces = s.split(&text);

        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.chars().count() <= 400));
        assert!(pieces.iter().all(|p| p.starts_with("Frase")));
    }

    #[test]
    fn falls_back_to_finer_separators() {
        let sentence = "Os candidatos devem apresentar documentos. ";
        let text = sentence.repeat(60);
        let s = TextSplitter::default();
        let pieces = s.split(&text);

        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.chars().count() <= 900));
        assert!(pieces.iter().all(|p| p.ends_with("documentos.")));
    }

    #[test]
    fn oversized_atom_is_hard_cut() {
        let text = "x".repeat(2000);
        let s = TextSplitter::new(900, 150);
        let pieces = s.split(&text);

        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len(), 900);
        assert_eq!(pieces[1].len(), 900);
        assert_eq!(pieces[2].len(), 2000 - 1500);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let text = "ção ".repeat(10);
        let s = TextSplitter::new(40, 0);
        assert_eq!(s.split(&text).len(), 1);
    }

    #[test]
    fn overlap_is_clamped() {
        let s = TextSplitter::new(10, 50);
        assert_eq!(s.chunk_overlap(), 9);
        assert_eq!(s.chunk_size(), 10);
    }
}
