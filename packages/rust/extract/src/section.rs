//! Hierarchical section context: a stack of headings and pseudo-headers.
//!
//! Levels on the stack are strictly increasing from bottom to top. Pushing a frame first
//! pops every frame at the same or a deeper level.

use harvester_shared::ContextSnapshot;

/// Level used for pseudo-headers and callouts, below `h6`.
pub const PSEUDO_LEVEL: u8 = 7;

/// Whether a frame survives the next non-enumeration paragraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Persistent,
    Temporary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionFrame {
    pub level: u8,
    pub text: String,
    pub kind: FrameKind,
}

#[derive(Debug, Default)]
pub struct SectionContextBuilder {
    stack: Vec<SectionFrame>,
}

impl SectionContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `h0`..`h6` map to their digit; anything else is a pseudo-header.
    pub fn level_for(tag: &str) -> u8 {
        let mut chars = tag.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some('h' | 'H'), Some(d), None) => d
                .to_digit(10)
                .and_then(|d| u8::try_from(d).ok())
                .filter(|d| *d < PSEUDO_LEVEL)
                .unwrap_or(PSEUDO_LEVEL),
            _ => PSEUDO_LEVEL,
        }
    }

    pub fn update_context(&mut self, tag: &str, text: impl Into<String>, kind: FrameKind) {
        let level = Self::level_for(tag);
        while self.stack.last().is_some_and(|top| top.level >= level) {
            self.stack.pop();
        }
        self.stack.push(SectionFrame {
            level,
            text: text.into(),
            kind,
        });
    }

    /// Pop frames from the top while they are temporary.
    pub fn pop_temporary_context(&mut self) {
        while self
            .stack
            .last()
            .is_some_and(|top| top.kind == FrameKind::Temporary)
        {
            self.stack.pop();
        }
    }

    /// Ordered `h<level>` / `pseudo` → text mapping, outermost first.
    pub fn current_context(&self) -> ContextSnapshot {
        self.stack
            .iter()
            .map(|frame| {
                let key = if frame.level < PSEUDO_LEVEL {
                    format!("h{}", frame.level)
                } else {
                    "pseudo".to_string()
                };
                (key, frame.text.clone())
            })
            .collect()
    }

    pub fn has_temporary_context(&self) -> bool {
        self.stack.iter().any(|f| f.kind == FrameKind::Temporary)
    }

    pub fn reset(&mut self) {
        self.stack.clear();
    }

    pub fn frames(&self) -> &[SectionFrame] {
        &self.stack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels() {
        assert_eq!(SectionContextBuilder::level_for("h0"), 0);
        assert_eq!(SectionContextBuilder::level_for("h3"), 3);
        assert_eq!(SectionContextBuilder::level_for("H6"), 6);
        assert_eq!(SectionContextBuilder::level_for("pseudo"), PSEUDO_LEVEL);
        assert_eq!(SectionContextBuilder::level_for("div"), PSEUDO_LEVEL);
        assert_eq!(SectionContextBuilder::level_for("h9"), PSEUDO_LEVEL);
    }

    #[test]
    fn sibling_heading_replaces_subtree() {
        let mut sb = SectionContextBuilder::new();
        sb.update_context("h2", "A", FrameKind::Persistent);
        sb.update_context("h3", "B", FrameKind::Persistent);
        sb.update_context("h2", "C", FrameKind::Persistent);

        let ctx = sb.current_context();
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get("h2"), Some("C"));
        assert_eq!(ctx.get("h3"), None);
    }

    #[test]
    fn nested_path_is_ordered() {
        let mut sb = SectionContextBuilder::new();
        sb.update_context("h0", "Conteúdo sobre o campus Picos", FrameKind::Persistent);
        sb.update_context("h1", "Cursos", FrameKind::Persistent);
        sb.update_context("h3", "Técnicos", FrameKind::Persistent);
        sb.update_context("pseudo", "Documentos exigidos na matrícula:", FrameKind::Temporary);

        assert_eq!(
            sb.current_context().joined(" > "),
            "Conteúdo sobre o campus Picos > Cursos > Técnicos > Documentos exigidos na matrícula:"
        );
        let levels: Vec<u8> = sb.frames().iter().map(|f| f.level).collect();
        assert!(levels.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn temporary_frames_pop_without_touching_headings() {
        let mut sb = SectionContextBuilder::new();
        sb.update_context("h2", "Inscrição", FrameKind::Persistent);
        sb.update_context("pseudo", "Documentos necessários para inscrição:", FrameKind::Temporary);
        assert!(sb.has_temporary_context());

        sb.pop_temporary_context();
        assert!(!sb.has_temporary_context());
        assert_eq!(sb.current_context().get("h2"), Some("Inscrição"));

        // Popping with nothing temporary on top is a no-op.
        sb.pop_temporary_context();
        assert_eq!(sb.frames().len(), 1);
    }

    #[test]
    fn heading_replaces_open_pseudo_header() {
        let mut sb = SectionContextBuilder::new();
        sb.update_context("pseudo", "Documentos necessários para inscrição:", FrameKind::Temporary);
        sb.update_context("h2", "Resultado", FrameKind::Persistent);
        assert!(!sb.has_temporary_context());
        assert_eq!(sb.frames().len(), 1);
    }

    #[test]
    fn reset_clears() {
        let mut sb = SectionContextBuilder::new();
        sb.update_context("h1", "x", FrameKind::Persistent);
        sb.reset();
        assert!(sb.current_context().is_empty());
    }
}
