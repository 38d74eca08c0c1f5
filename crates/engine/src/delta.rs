//! Chunk normalisation for backends that restate earlier output.
//!
//! Some runtimes hand the callback the whole text generated so far instead
//! of the new piece. [`reconcile`] returns the part of a chunk that is
//! actually new relative to what has been accumulated.

use lt_providers::ChunkMode;

/// Return the portion of `chunk` to append to `existing`.
///
/// Rules, first match wins:
/// 1. empty chunk appends nothing
/// 2. empty `existing` appends the whole chunk
/// 3. a chunk that starts with `existing` appends only what follows it
/// 4. a chunk that `existing` already ends with appends nothing
/// 5. otherwise the longest suffix of `existing` that prefixes the chunk
///    is skipped and the rest appended
///
/// Overlap is only ever matched at the boundary between the two strings.
pub fn reconcile<'a>(existing: &str, chunk: &'a str) -> &'a str {
    if chunk.is_empty() {
        return "";
    }
    if existing.is_empty() {
        return chunk;
    }
    if let Some(rest) = chunk.strip_prefix(existing) {
        return rest;
    }
    if existing.ends_with(chunk) {
        return "";
    }

    let max = existing.len().min(chunk.len());
    for overlap in (1..=max).rev() {
        let tail_start = existing.len() - overlap;
        if !existing.is_char_boundary(tail_start) || !chunk.is_char_boundary(overlap) {
            continue;
        }
        if existing[tail_start..] == chunk[..overlap] {
            return &chunk[overlap..];
        }
    }
    chunk
}

/// Applies [`reconcile`] according to the source's [`ChunkMode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaReconciler {
    mode: ChunkMode,
}

impl DeltaReconciler {
    pub fn new(mode: ChunkMode) -> Self {
        Self { mode }
    }

    /// The new text carried by `chunk` given everything the current source
    /// has produced so far.
    pub fn delta<'a>(&self, existing: &str, chunk: &'a str) -> &'a str {
        match self.mode {
            ChunkMode::Auto => reconcile(existing, chunk),
            ChunkMode::Delta => chunk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulate(chunks: &[&str]) -> String {
        let mut acc = String::new();
        for c in chunks {
            let d = reconcile(&acc, c).to_string();
            acc.push_str(&d);
        }
        acc
    }

    #[test]
    fn empty_chunk_appends_nothing() {
        assert_eq!(reconcile("abc", ""), "");
        assert_eq!(reconcile("", ""), "");
    }

    #[test]
    fn empty_existing_takes_whole_chunk() {
        assert_eq!(reconcile("", "hello"), "hello");
    }

    #[test]
    fn restating_existing_appends_nothing() {
        assert_eq!(reconcile("Hello world", "Hello world"), "");
    }

    #[test]
    fn cumulative_chunk_appends_suffix() {
        assert_eq!(reconcile("Hel", "Hello wor"), "lo wor");
    }

    #[test]
    fn duplicate_tail_appends_nothing() {
        assert_eq!(reconcile("Hello world", "world"), "");
    }

    #[test]
    fn boundary_overlap_is_trimmed() {
        assert_eq!(reconcile("The quick br", "brown fox"), "own fox");
    }

    #[test]
    fn overlap_is_not_searched_globally() {
        // "the" appears earlier but not at the boundary.
        assert_eq!(reconcile("the cat sat", " the end"), " the end");
    }

    #[test]
    fn plain_delta_passes_through() {
        assert_eq!(reconcile("Hello", " there"), " there");
    }

    #[test]
    fn cumulative_sequence_rebuilds_final_text() {
        assert_eq!(accumulate(&["Hel", "Hello wor", "Hello world"]), "Hello world");
    }

    #[test]
    fn mixed_delta_and_cumulative() {
        assert_eq!(
            accumulate(&["The ", "The answer", " is", "The answer is 42"]),
            "The answer is 42"
        );
    }

    #[test]
    fn multibyte_boundaries_are_respected() {
        assert_eq!(reconcile("naïve caf", "café au lait"), "é au lait");
        assert_eq!(reconcile("日本", "本語"), "語");
    }

    #[test]
    fn delta_mode_keeps_repeated_short_tokens() {
        let auto = DeltaReconciler::new(ChunkMode::Auto);
        let delta = DeltaReconciler::new(ChunkMode::Delta);
        assert_eq!(auto.delta("Hel", "l"), "");
        assert_eq!(delta.delta("Hel", "l"), "l");
    }
}
